use std::collections::{BTreeMap, VecDeque};

const SCENE_MEMORY: usize = 10;
const COMMENT_MEMORY: usize = 20;
/// How many of the remembered comments go into a reasoning prompt.
pub const COMMENTS_IN_CONTEXT: usize = 5;

/// Short-term memory of what was on screen and what the viewer said.
#[derive(Debug, Default, Clone)]
pub struct ContextMemory {
    scenes: VecDeque<String>,
    comments: VecDeque<String>,
    characters: BTreeMap<String, String>,
}

impl ContextMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_scene(&mut self, caption: &str) {
        if self.scenes.back().map(String::as_str) == Some(caption) {
            return;
        }
        if self.scenes.len() >= SCENE_MEMORY {
            self.scenes.pop_front();
        }
        self.scenes.push_back(caption.to_string());
    }

    pub fn add_comment(&mut self, text: &str) {
        let text = text.trim();
        if text.is_empty() {
            return;
        }
        if self.comments.len() >= COMMENT_MEMORY {
            self.comments.pop_front();
        }
        self.comments.push_back(text.to_string());
    }

    pub fn remember_character(&mut self, name: &str, description: &str) {
        self.characters
            .insert(name.trim().to_string(), description.trim().to_string());
    }

    /// Recent scenes, oldest first.
    pub fn recent_scenes(&self, n: usize) -> Vec<String> {
        let skip = self.scenes.len().saturating_sub(n);
        self.scenes.iter().skip(skip).cloned().collect()
    }

    /// The comments that go into a reasoning prompt, oldest first.
    pub fn recent_comments(&self) -> Vec<String> {
        let skip = self.comments.len().saturating_sub(COMMENTS_IN_CONTEXT);
        self.comments.iter().skip(skip).cloned().collect()
    }

    pub fn characters(&self) -> &BTreeMap<String, String> {
        &self.characters
    }

    pub fn last_scene(&self) -> Option<&str> {
        self.scenes.back().map(String::as_str)
    }
}
