//! send_test_alert - push one test alert through the configured notifier.
//!
//! Uses the same configuration as camwatchd, so a successful run confirms the
//! broker address, credentials and recipients before real alerts are needed.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;

use camwatch::notify::MqttNotifier;
use camwatch::{Alert, CamwatchConfig, ConversationState, LogFacadeSink, LogNotifier, Notifier};

#[derive(Parser, Debug)]
#[command(author, version, about = "Send a test alert through the configured notifier")]
struct Args {
    /// JSON config file. Environment variables override its values.
    #[arg(long, env = "CAMWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// Camera id the alert is attributed to. Defaults to the first camera.
    #[arg(long)]
    camera: Option<String>,

    /// Image to attach.
    #[arg(long)]
    attachment: Option<PathBuf>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = CamwatchConfig::load_from(args.config.as_deref())?;
    let sink = LogFacadeSink::shared();

    let camera_id = args
        .camera
        .or_else(|| cfg.cameras.first().map(|c| c.id.clone()))
        .unwrap_or_else(|| "test".to_string());
    let alert = Alert {
        camera_id,
        subject: "Test Notification".to_string(),
        body: "This is a test alert sent from camwatch.".to_string(),
        recipients: cfg.alerts.recipients.clone(),
        attachment: args.attachment,
    };

    let mut notifier: Box<dyn Notifier> = match &cfg.alerts.mqtt {
        Some(settings) => Box::new(MqttNotifier::connect(settings.clone(), sink)?),
        None => {
            log::warn!("MQTT_BROKER_ADDR not set; test alert goes to the log only");
            Box::new(LogNotifier::new(sink))
        }
    };

    let mut conversation = ConversationState::new();
    notifier.deliver(&alert, &mut conversation)?;
    log::info!(
        "test alert sent via {} to {} recipient(s), thread {}",
        notifier.name(),
        alert.recipients.len(),
        conversation.thread_id().unwrap_or("-")
    );
    Ok(())
}
