//! cinemate-control - CLI control utility for the CineMate daemon
//!
//! Talks to the daemon's line-based control port on localhost.

use clap::{Parser, Subcommand};
use std::io::{BufRead, BufReader, Write};
use std::net::TcpStream;
use std::time::Duration;

/// CLI control utility for the CineMate daemon
#[derive(Parser)]
#[command(name = "cinemate-control")]
#[command(author = "StarTuz")]
#[command(version)]
#[command(about = "Control utility for the CineMate watch-along companion", long_about = None)]
struct Cli {
    /// Control port of the daemon
    #[arg(short, long, default_value = "6570")]
    port: u16,

    /// Host the daemon listens on
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask the companion a question, as if it had been addressed by name
    Ask {
        /// The question
        #[arg(required = true)]
        question: Vec<String>,
    },

    /// Resume a video the companion paused
    Resume,

    /// Show what the companion is doing
    Status,

    /// Tell the companion who a character is
    Remember {
        /// Character name
        name: String,
        /// Who they are
        #[arg(required = true)]
        description: Vec<String>,
    },
}

fn send(host: &str, port: u16, line: &str) -> Result<String, Box<dyn std::error::Error>> {
    let stream = TcpStream::connect((host, port))
        .map_err(|e| format!("cannot reach CineMate on {}:{} ({}). Is the daemon running?", host, port, e))?;
    stream.set_read_timeout(Some(Duration::from_secs(5)))?;
    let mut writer = stream.try_clone()?;
    let mut reader = BufReader::new(stream);

    let mut greeting = String::new();
    reader.read_line(&mut greeting)?;
    if !greeting.starts_with("299") {
        return Err(format!("unexpected greeting: {}", greeting.trim()).into());
    }

    write!(writer, "{}\r\nQUIT\r\n", line)?;
    let mut reply = String::new();
    reader.read_line(&mut reply)?;
    Ok(reply.trim_end().to_string())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let line = match &cli.command {
        Commands::Ask { question } => format!("ASK {}", question.join(" ")),
        Commands::Resume => "RESUME".to_string(),
        Commands::Status => "STATUS".to_string(),
        Commands::Remember { name, description } => format!("REMEMBER {} = {}", name, description.join(" ")),
    };

    let reply = send(&cli.host, cli.port, &line)?;
    let (code, body) = reply.split_once(' ').unwrap_or((reply.as_str(), ""));
    if code != "200" {
        return Err(format!("CineMate refused: {}", body).into());
    }

    match cli.command {
        Commands::Status => {
            let status: serde_json::Value = serde_json::from_str(body)?;
            println!("📊 CineMate Status");
            println!("  Mode:      {}", status["mode"].as_str().unwrap_or("?"));
            println!("  Listening: {}", status["listening"]);
            println!("  Dialogue:  {}", status["dialogue_active"]);
            match status["speaking"].as_str() {
                Some(text) => println!("  Speaking:  \"{}\"", text),
                None => println!("  Speaking:  -"),
            }
            println!("  Queued:    {}", status["queued"]);
            println!("  Paused:    {}", status["video_paused"]);
            if let Some(scene) = status["last_scene"].as_str() {
                println!("  Scene:     {}", scene);
            }
            println!(
                "  Analyzed {} scenes, spoke {} times in {}s",
                status["scenes_analyzed"], status["utterances_delivered"], status["uptime_secs"]
            );
        }
        _ => println!("✅ {}", body),
    }
    Ok(())
}
