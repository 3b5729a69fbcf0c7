//! camwatchd - multi-camera motion-gated detection daemon
//!
//! This daemon:
//! 1. Starts one acquisition thread per configured camera
//! 2. Feeds frames through a bounded channel to a single consumer
//! 3. Gates each camera on motion and the detection cooldown
//! 4. Persists and classifies the frame on motion
//! 5. Alerts on alert-worthy labels outside the alert cooldown

use anyhow::{anyhow, Result};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use camwatch::classify::ArtifactWriter;
use camwatch::notify::MqttNotifier;
use camwatch::{
    CamwatchConfig, Capabilities, Classifier, JpegFrameStore, LogFacadeSink, LogNotifier, LogSink,
    Notifier, Orchestrator, StreamMultiplexer, StubClassifier,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum ClassifierKind {
    /// Canned results, no model needed.
    Stub,
    /// ONNX model on tract (requires the backend-tract feature).
    Tract,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Multi-camera motion-gated object detection")]
struct Args {
    /// JSON config file. Environment variables override its values.
    #[arg(long, env = "CAMWATCH_CONFIG")]
    config: Option<PathBuf>,

    /// How long the consumer waits for a frame before re-checking shutdown.
    #[arg(long, env = "CAMWATCH_POLL_TIMEOUT_MS", default_value_t = 500)]
    poll_timeout_ms: u64,

    /// Interval between health log lines; 0 disables them.
    #[arg(long, env = "CAMWATCH_HEALTH_INTERVAL_SECS", default_value_t = 60)]
    health_interval_secs: u64,

    #[arg(long, env = "CAMWATCH_CLASSIFIER", value_enum, default_value_t = ClassifierKind::Stub)]
    classifier: ClassifierKind,

    /// With the stub classifier, report this label over the whole frame on
    /// every escalation. Without it the stub never detects anything.
    /// Matched case-insensitively against ALERT_LABELS.
    #[arg(long, env = "CAMWATCH_STUB_LABEL")]
    stub_label: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let cfg = CamwatchConfig::load_from(args.config.as_deref())?;
    let sink = LogFacadeSink::shared();

    let sources = cfg.camera_sources();
    for source in &sources {
        log::info!(
            "camera {} ({}) at {}",
            source.id(),
            source.name(),
            source.redacted_url()
        );
    }

    let mut classifier = build_classifier(&args, &cfg, sink.clone())?;
    classifier.warm_up()?;
    let notifier = build_notifier(&cfg, sink.clone())?;
    log::info!(
        "classifier={} notifier={} captures={} detections={}",
        classifier.name(),
        notifier.name(),
        cfg.paths.capture_dir.display(),
        cfg.paths.detections_dir.display()
    );

    let mut orchestrator_cfg = cfg.orchestrator_config();
    orchestrator_cfg.health_interval = match args.health_interval_secs {
        0 => None,
        secs => Some(Duration::from_secs(secs)),
    };
    let mut orchestrator = Orchestrator::new(
        orchestrator_cfg,
        &sources,
        Capabilities {
            classifier,
            notifier,
            store: Box::new(JpegFrameStore::new(&cfg.paths.capture_dir)),
        },
        sink.clone(),
    )?;

    let mut mux = StreamMultiplexer::start(sources, cfg.multiplexer_options(), sink)?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    ctrlc::set_handler(move || {
        stop_flag.store(true, Ordering::SeqCst);
    })
    .expect("error setting Ctrl-C handler");

    log::info!(
        "camwatchd running with {} camera(s); Ctrl-C to stop",
        mux.camera_ids().len()
    );
    let result = orchestrator.run(
        &mux,
        &stop,
        Duration::from_millis(args.poll_timeout_ms),
    );
    if result.is_err() {
        stop.store(true, Ordering::SeqCst);
    }

    log::info!("shutting down acquisition threads...");
    let stopped = mux.stop();
    result?;
    stopped?;

    let stats = orchestrator.stats();
    log::info!(
        "camwatchd stopped: frames={} escalations={} alerts={}",
        stats.frames_seen,
        stats.escalations,
        stats.alerts_sent
    );
    Ok(())
}

fn build_classifier(
    args: &Args,
    cfg: &CamwatchConfig,
    sink: Arc<dyn LogSink>,
) -> Result<Box<dyn Classifier>> {
    let mut artifacts = ArtifactWriter::new(&cfg.paths.detections_dir, sink);
    if let Some(dir) = &cfg.paths.training_dir {
        artifacts = artifacts.with_training_data(dir, cfg.detection.classes.clone());
    }

    match args.classifier {
        ClassifierKind::Stub => {
            let stub = match &args.stub_label {
                Some(label) => StubClassifier::whole_frame(stub_label(label), 1.0),
                None => StubClassifier::empty(),
            };
            Ok(Box::new(stub.with_artifacts(artifacts)))
        }
        ClassifierKind::Tract => build_tract(cfg, artifacts),
    }
}

/// Classifier labels are lower case, like the normalised alert set.
fn stub_label(label: &str) -> String {
    label.trim().to_lowercase()
}

#[cfg(feature = "backend-tract")]
fn build_tract(cfg: &CamwatchConfig, artifacts: ArtifactWriter) -> Result<Box<dyn Classifier>> {
    use camwatch::classify::tract::TractClassifier;
    use camwatch::classify::COCO_CLASSES;
    use camwatch::DetectionFilter;

    let model_path = cfg
        .detection
        .model_path
        .as_ref()
        .ok_or_else(|| anyhow!("--classifier tract requires MODEL_PATH"))?;
    let class_names = COCO_CLASSES.iter().map(|c| c.to_string()).collect();
    let classifier = TractClassifier::new(model_path, cfg.detection.input_size, class_names)?
        .with_filter(DetectionFilter::new(
            cfg.detection.classes.clone(),
            cfg.detection.confidence_threshold,
        ))
        .with_artifacts(artifacts);
    Ok(Box::new(classifier))
}

#[cfg(not(feature = "backend-tract"))]
fn build_tract(_cfg: &CamwatchConfig, _artifacts: ArtifactWriter) -> Result<Box<dyn Classifier>> {
    Err(anyhow!(
        "--classifier tract requires building with --features backend-tract"
    ))
}

fn build_notifier(cfg: &CamwatchConfig, sink: Arc<dyn LogSink>) -> Result<Box<dyn Notifier>> {
    match &cfg.alerts.mqtt {
        Some(settings) => Ok(Box::new(MqttNotifier::connect(settings.clone(), sink)?)),
        None => {
            log::warn!("MQTT_BROKER_ADDR not set; alerts go to the log only");
            Ok(Box::new(LogNotifier::new(sink)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stub_label_matches_normalised_alert_labels() {
        assert_eq!(stub_label(" Person "), "person");
        let args = Args::parse_from(["camwatchd", "--stub-label", "CAR"]);
        assert_eq!(args.stub_label.as_deref().map(stub_label).as_deref(), Some("car"));
    }
}
