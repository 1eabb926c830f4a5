//! One-shot chat over a live session.

use std::io::Write;
use std::time::Duration;

use clap::Args;
use tokio::time::timeout;

use giztoy_gemini_live::{
    Channel, Configuration, Event, LogLevel, MODEL_GEMINI_2_0_FLASH_EXP, Part, ResponseModality,
};

use super::{create_client, get_context, print_verbose, print_warning};
use crate::Cli;

/// Send one user turn and stream the reply to stdout.
#[derive(Args)]
pub struct ChatCommand {
    /// Message to send
    text: String,
    /// Model to use (overrides config file)
    #[arg(long)]
    model: Option<String>,
    /// Voice for audio output (overrides config file)
    #[arg(long)]
    voice: Option<String>,
    /// System instruction
    #[arg(long)]
    system: Option<String>,
    /// Also request audio; its total duration is reported
    #[arg(long)]
    audio: bool,
    /// Seconds to wait for the turn to complete
    #[arg(long, default_value_t = 60)]
    timeout: u64,
}

impl ChatCommand {
    pub async fn run(&self, cli: &Cli) -> anyhow::Result<()> {
        let ctx = get_context(cli)?;
        let client = create_client(ctx.as_ref())?;

        let model = self
            .model
            .clone()
            .or_else(|| ctx.as_ref().map(|c| c.model.clone()).filter(|m| !m.is_empty()))
            .unwrap_or_else(|| MODEL_GEMINI_2_0_FLASH_EXP.to_string());

        let mut config = Configuration::new(model);
        if self.audio {
            config = config.with_modalities(ResponseModality::Mixed);
            let voice = self
                .voice
                .clone()
                .or_else(|| ctx.as_ref().map(|c| c.voice.clone()).filter(|v| !v.is_empty()));
            if let Some(voice) = voice {
                config = config.with_voice(voice);
            }
        }
        if let Some(system) = &self.system {
            config = config.with_system_instruction(system.clone());
        }

        let session = client.session();
        let mut events = session.events_on(&[
            Channel::Content,
            Channel::Audio,
            Channel::TurnComplete,
            Channel::Close,
            Channel::GoAway,
            Channel::Log,
        ]);

        print_verbose(cli, &format!("Connecting with model {}", config.model));
        session.connect(config).await?;
        session.send_text(vec![Part::text(self.text.clone())], true)?;

        let mut audio = Duration::ZERO;
        let mut stdout = std::io::stdout();
        let outcome = timeout(Duration::from_secs(self.timeout), async {
            while let Some(event) = events.recv().await {
                match event {
                    Event::Content(content) => {
                        print!("{}", content.text());
                        stdout.flush()?;
                    }
                    Event::Audio(chunk) => audio += chunk.duration(),
                    Event::TurnComplete => return Ok(()),
                    Event::GoAway { time_left } => print_warning(&format!(
                        "server is closing the session (time left: {})",
                        time_left.as_deref().unwrap_or("unknown")
                    )),
                    Event::Log(record) if record.level >= LogLevel::Warn => {
                        print_verbose(cli, &format!("[{}] {}", record.source, record.message))
                    }
                    Event::Close(info) => {
                        anyhow::bail!("session closed: {} {}", info.reason.as_str(), info.message)
                    }
                    _ => {}
                }
            }
            Ok::<(), anyhow::Error>(())
        })
        .await;
        println!();

        session.disconnect().await;

        match outcome {
            Ok(result) => result?,
            Err(_) => anyhow::bail!("timed out after {}s waiting for the reply", self.timeout),
        }
        if self.audio {
            print_verbose(cli, &format!("Received {:?} of audio", audio));
            eprintln!("audio: {:.2}s", audio.as_secs_f64());
        }
        Ok(())
    }
}
