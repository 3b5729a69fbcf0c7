use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use camwatch::config::CamwatchConfig;
use camwatch::PipelineError;

static ENV_LOCK: Mutex<()> = Mutex::new(());

const ENV_KEYS: &[&str] = &[
    "CAMWATCH_CONFIG",
    "STREAM_RECONNECT_DELAY",
    "FRAME_BUFFER_FLUSH",
    "MAX_FRAME_BUFFER_SIZE",
    "PIXEL_DIFF_THRESHOLD",
    "MOTION_AREA_THRESHOLD",
    "FRAME_CAPTURE_DELAY",
    "DETECTION_COOLDOWN",
    "ALERT_COOLDOWN",
    "EMAIL_COOLDOWN",
    "ALERT_LABELS",
    "DETECTION_CLASSES",
    "CONFIDENCE_THRESHOLD",
    "CAPTURE_DIR",
    "DETECTIONS_DIR",
    "TRAINING_DATA_DIR",
    "ALERT_RECIPIENTS",
    "ALERT_EMAILS",
    "MODEL_PATH",
    "MQTT_BROKER_ADDR",
    "MQTT_TOPIC_PREFIX",
    "MQTT_USERNAME",
    "MQTT_PASSWORD",
    "MQTT_CLIENT_ID",
];

fn clear_env() {
    for key in ENV_KEYS {
        std::env::remove_var(key);
    }
    for i in 1..=9 {
        for suffix in ["URL", "RTSP", "NAME"] {
            std::env::remove_var(format!("CAMERA_{}_{}", i, suffix));
        }
    }
}

fn write_config(json: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().expect("temp config");
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");
    file
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{
            "cameras": [
                {"id": "cam1", "name": "Driveway", "url": "rtsp://10.0.0.5/stream", "target_fps": 8},
                {"id": "porch", "url": "stub://porch", "frame_flush": 0}
            ],
            "stream": {"reconnect_delay_secs": 2, "channel_capacity": 12},
            "motion": {"pixel_threshold": 30, "min_area": 900},
            "detection": {
                "alert_cooldown_secs": 120,
                "alert_labels": ["person", "car"],
                "confidence_threshold": 0.7
            },
            "paths": {"capture_dir": "/var/lib/camwatch/captures"},
            "alerts": {
                "recipients": ["ops@example.com"],
                "mqtt": {"broker_addr": "broker.lan:1883", "topic_prefix": "home/cams"}
            }
        }"#,
    );

    std::env::set_var("CAMWATCH_CONFIG", file.path());
    std::env::set_var("CAMERA_1_NAME", "Front Drive");
    std::env::set_var("CAMERA_2_RTSP", "rtsp://10.0.0.6/stream");
    std::env::set_var("MOTION_AREA_THRESHOLD", "2500");
    std::env::set_var("EMAIL_COOLDOWN", "90");
    std::env::set_var("ALERT_EMAILS", "a@example.com, b@example.com");
    std::env::set_var("MQTT_USERNAME", "camwatch");

    let cfg = CamwatchConfig::load().expect("load config");

    assert_eq!(cfg.cameras.len(), 3);
    assert_eq!(cfg.cameras[0].id, "cam1");
    assert_eq!(cfg.cameras[0].name, "Front Drive");
    assert_eq!(cfg.cameras[0].url, "rtsp://10.0.0.5/stream");
    assert_eq!(cfg.cameras[2].id, "cam2");
    assert_eq!(cfg.cameras[2].name, "Camera 2");
    assert_eq!(cfg.cameras[2].url, "rtsp://10.0.0.6/stream");

    assert_eq!(cfg.stream.reconnect_delay, Duration::from_secs(2));
    assert_eq!(cfg.stream.channel_capacity, 12);
    assert_eq!(cfg.motion.pixel_threshold, 30);
    assert_eq!(cfg.motion.min_area, 2500);
    assert_eq!(cfg.detection.alert_cooldown, Duration::from_secs(90));
    assert!(cfg.detection.alert_labels.contains("car"));
    assert_eq!(cfg.detection.confidence_threshold, 0.7);
    assert_eq!(
        cfg.paths.capture_dir,
        std::path::PathBuf::from("/var/lib/camwatch/captures")
    );
    assert_eq!(cfg.alerts.recipients, vec!["a@example.com", "b@example.com"]);

    let mqtt = cfg.alerts.mqtt.as_ref().expect("mqtt settings");
    assert_eq!(mqtt.broker_addr, "broker.lan:1883");
    assert_eq!(mqtt.topic_prefix, "home/cams");
    assert_eq!(mqtt.username.as_deref(), Some("camwatch"));

    let sources = cfg.camera_sources();
    assert_eq!(sources[0].target_fps(), 8);
    assert_eq!(sources[1].frame_flush(), 0);
    assert_eq!(sources[2].reconnect_delay(), Duration::from_secs(2));
    assert_eq!(cfg.multiplexer_options().channel_capacity, 12);
    assert_eq!(cfg.orchestrator_config().alert_cooldown, Duration::from_secs(90));

    clear_env();
}

#[test]
fn env_only_cameras_use_defaults() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMERA_1_URL", "stub://one");
    std::env::set_var("CAMERA_3_URL", "stub://three");
    std::env::set_var("CAMERA_3_NAME", "Garage");
    std::env::set_var("MQTT_BROKER_ADDR", "127.0.0.1:1883");

    let cfg = CamwatchConfig::load_from(None).expect("load config");
    let ids: Vec<&str> = cfg.cameras.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["cam1", "cam3"]);
    assert_eq!(cfg.cameras[1].name, "Garage");
    assert_eq!(cfg.stream.frame_flush, 3);
    assert_eq!(cfg.detection.detection_cooldown, Duration::from_secs(5));

    let mqtt = cfg.alerts.mqtt.as_ref().expect("mqtt from env");
    assert_eq!(mqtt.topic_prefix, "camwatch");
    assert_eq!(mqtt.client_id, "camwatch");

    clear_env();
}

#[test]
fn rejects_missing_cameras() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let err = CamwatchConfig::load_from(None).expect_err("no cameras");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::InvalidConfig(_))
    ));

    clear_env();
}

#[test]
fn rejects_duplicate_camera_ids() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let file = write_config(
        r#"{"cameras": [
            {"id": "gate", "url": "stub://a"},
            {"id": "gate", "url": "stub://b"}
        ]}"#,
    );
    let err = CamwatchConfig::load_from(Some(file.path())).expect_err("duplicate ids");
    assert!(matches!(
        err.downcast_ref::<PipelineError>(),
        Some(PipelineError::DuplicateCamera(id)) if id == "gate"
    ));

    clear_env();
}

#[test]
fn rejects_out_of_range_values() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();
    std::env::set_var("CAMERA_1_URL", "stub://one");

    std::env::set_var("CONFIDENCE_THRESHOLD", "0");
    assert!(CamwatchConfig::load_from(None).is_err());
    std::env::set_var("CONFIDENCE_THRESHOLD", "1.5");
    assert!(CamwatchConfig::load_from(None).is_err());
    std::env::remove_var("CONFIDENCE_THRESHOLD");

    std::env::set_var("MAX_FRAME_BUFFER_SIZE", "0");
    assert!(CamwatchConfig::load_from(None).is_err());
    std::env::remove_var("MAX_FRAME_BUFFER_SIZE");

    std::env::set_var("ALERT_LABELS", " , ");
    assert!(CamwatchConfig::load_from(None).is_err());
    std::env::remove_var("ALERT_LABELS");

    std::env::set_var("PIXEL_DIFF_THRESHOLD", "300");
    assert!(CamwatchConfig::load_from(None).is_err());
    std::env::remove_var("PIXEL_DIFF_THRESHOLD");

    std::env::set_var("DETECTION_COOLDOWN", "-5");
    assert!(CamwatchConfig::load_from(None).is_err());

    clear_env();
}

#[test]
fn rejects_unreadable_or_malformed_files() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let missing = std::path::Path::new("/nonexistent/camwatch.json");
    assert!(CamwatchConfig::load_from(Some(missing)).is_err());

    let file = write_config("{ not json");
    assert!(CamwatchConfig::load_from(Some(file.path())).is_err());

    clear_env();
}

#[test]
fn label_lists_are_normalised_to_classifier_case() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("CAMERA_1_URL", "stub://one");
    std::env::set_var("DETECTION_CLASSES", " Person,CAR , ");
    std::env::set_var("ALERT_LABELS", "Person");

    let cfg = CamwatchConfig::load_from(None).expect("load config");
    assert_eq!(cfg.detection.classes, vec!["person", "car"]);
    assert!(cfg.detection.alert_labels.contains("person"));

    let filter = camwatch::DetectionFilter::new(cfg.detection.classes.clone(), 0.5);
    assert!(filter.accepts("car", 0.9));

    clear_env();
}
