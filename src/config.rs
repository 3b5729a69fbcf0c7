use anyhow::{anyhow, Result};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::PipelineError;
use crate::ingest::{CameraSource, DEFAULT_FRAME_FLUSH, DEFAULT_RECONNECT_DELAY};
use crate::motion::{MotionThresholds, DEFAULT_MIN_AREA, DEFAULT_PIXEL_THRESHOLD};
use crate::mux::{
    MultiplexerOptions, DEFAULT_CHANNEL_CAPACITY, DEFAULT_IDLE_SLEEP, DEFAULT_PUSH_TIMEOUT,
};
use crate::notify::mqtt::{MqttSettings, DEFAULT_CLIENT_ID, DEFAULT_TOPIC_PREFIX};
use crate::orchestrator::{
    OrchestratorConfig, DEFAULT_ALERT_COOLDOWN, DEFAULT_DETECTION_COOLDOWN,
    DEFAULT_STABILIZATION_DELAY,
};

pub const CONFIG_ENV: &str = "CAMWATCH_CONFIG";
/// Environment cameras are read from `CAMERA_1_*` through `CAMERA_9_*`.
pub const MAX_ENV_CAMERAS: usize = 9;

const DEFAULT_CAPTURE_DIR: &str = "captures";
const DEFAULT_DETECTIONS_DIR: &str = "detections";
const DEFAULT_CONFIDENCE: f32 = 0.6;
const DEFAULT_INPUT_SIZE: u32 = 640;
const DEFAULT_DETECTION_CLASSES: [&str; 2] = ["person", "car"];
const DEFAULT_ALERT_LABELS: [&str; 1] = ["person"];

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct CamwatchConfigFile {
    cameras: Option<Vec<CameraConfigFile>>,
    stream: Option<StreamConfigFile>,
    motion: Option<MotionConfigFile>,
    detection: Option<DetectionConfigFile>,
    paths: Option<PathsConfigFile>,
    alerts: Option<AlertsConfigFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CameraConfigFile {
    id: String,
    name: Option<String>,
    url: String,
    reconnect_delay_secs: Option<f64>,
    frame_flush: Option<u32>,
    target_fps: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct StreamConfigFile {
    reconnect_delay_secs: Option<f64>,
    frame_flush: Option<u32>,
    channel_capacity: Option<usize>,
    push_timeout_ms: Option<u64>,
    idle_sleep_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct MotionConfigFile {
    pixel_threshold: Option<u8>,
    min_area: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct DetectionConfigFile {
    stabilization_delay_secs: Option<f64>,
    detection_cooldown_secs: Option<f64>,
    alert_cooldown_secs: Option<f64>,
    alert_labels: Option<Vec<String>>,
    classes: Option<Vec<String>>,
    confidence_threshold: Option<f32>,
    model_path: Option<PathBuf>,
    input_size: Option<u32>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct PathsConfigFile {
    capture_dir: Option<PathBuf>,
    detections_dir: Option<PathBuf>,
    training_dir: Option<PathBuf>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct AlertsConfigFile {
    recipients: Option<Vec<String>>,
    mqtt: Option<MqttConfigFile>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct MqttConfigFile {
    broker_addr: String,
    topic_prefix: Option<String>,
    client_id: Option<String>,
    username: Option<String>,
    password: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CamwatchConfig {
    pub cameras: Vec<CameraSettings>,
    pub stream: StreamSettings,
    pub motion: MotionThresholds,
    pub detection: DetectionSettings,
    pub paths: PathSettings,
    pub alerts: AlertSettings,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraSettings {
    pub id: String,
    pub name: String,
    pub url: String,
    /// Per-camera override of `stream.reconnect_delay`.
    pub reconnect_delay: Option<Duration>,
    /// Per-camera override of `stream.frame_flush`.
    pub frame_flush: Option<u32>,
    pub target_fps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSettings {
    pub reconnect_delay: Duration,
    pub frame_flush: u32,
    pub channel_capacity: usize,
    pub push_timeout: Duration,
    pub idle_sleep: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DetectionSettings {
    pub stabilization_delay: Duration,
    pub detection_cooldown: Duration,
    pub alert_cooldown: Duration,
    pub alert_labels: BTreeSet<String>,
    /// Labels the classifier reports; also the YOLO training class order.
    pub classes: Vec<String>,
    pub confidence_threshold: f32,
    pub model_path: Option<PathBuf>,
    pub input_size: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSettings {
    pub capture_dir: PathBuf,
    pub detections_dir: PathBuf,
    pub training_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlertSettings {
    pub recipients: Vec<String>,
    pub mqtt: Option<MqttSettings>,
}

impl CamwatchConfig {
    /// Load from the file named by `CAMWATCH_CONFIG` (if any), then the environment.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var(CONFIG_ENV).ok().filter(|p| !p.trim().is_empty());
        Self::load_from(config_path.as_deref().map(Path::new))
    }

    /// Load from an explicit file (if any), then the environment.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: CamwatchConfigFile) -> Result<Self> {
        let stream_file = file.stream.unwrap_or_default();
        let stream = StreamSettings {
            reconnect_delay: match stream_file.reconnect_delay_secs {
                Some(secs) => secs_f64("stream.reconnect_delay_secs", secs)?,
                None => DEFAULT_RECONNECT_DELAY,
            },
            frame_flush: stream_file.frame_flush.unwrap_or(DEFAULT_FRAME_FLUSH),
            channel_capacity: stream_file
                .channel_capacity
                .unwrap_or(DEFAULT_CHANNEL_CAPACITY),
            push_timeout: stream_file
                .push_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_PUSH_TIMEOUT),
            idle_sleep: stream_file
                .idle_sleep_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_IDLE_SLEEP),
        };

        let mut cameras = Vec::new();
        for camera in file.cameras.unwrap_or_default() {
            let reconnect_delay = match camera.reconnect_delay_secs {
                Some(secs) => Some(secs_f64("cameras[].reconnect_delay_secs", secs)?),
                None => None,
            };
            cameras.push(CameraSettings {
                name: camera.name.unwrap_or_else(|| camera.id.clone()),
                id: camera.id,
                url: camera.url,
                reconnect_delay,
                frame_flush: camera.frame_flush,
                target_fps: camera.target_fps.unwrap_or(0),
            });
        }

        let motion_file = file.motion.unwrap_or_default();
        let motion = MotionThresholds {
            pixel_threshold: motion_file.pixel_threshold.unwrap_or(DEFAULT_PIXEL_THRESHOLD),
            min_area: motion_file.min_area.unwrap_or(DEFAULT_MIN_AREA),
        };

        let det = file.detection.unwrap_or_default();
        let detection = DetectionSettings {
            stabilization_delay: match det.stabilization_delay_secs {
                Some(secs) => secs_f64("detection.stabilization_delay_secs", secs)?,
                None => DEFAULT_STABILIZATION_DELAY,
            },
            detection_cooldown: match det.detection_cooldown_secs {
                Some(secs) => secs_f64("detection.detection_cooldown_secs", secs)?,
                None => DEFAULT_DETECTION_COOLDOWN,
            },
            alert_cooldown: match det.alert_cooldown_secs {
                Some(secs) => secs_f64("detection.alert_cooldown_secs", secs)?,
                None => DEFAULT_ALERT_COOLDOWN,
            },
            alert_labels: det
                .alert_labels
                .map(|labels| labels.into_iter().collect())
                .unwrap_or_else(|| DEFAULT_ALERT_LABELS.iter().map(|s| s.to_string()).collect()),
            classes: det
                .classes
                .unwrap_or_else(|| DEFAULT_DETECTION_CLASSES.iter().map(|s| s.to_string()).collect()),
            confidence_threshold: det.confidence_threshold.unwrap_or(DEFAULT_CONFIDENCE),
            model_path: det.model_path,
            input_size: det.input_size.unwrap_or(DEFAULT_INPUT_SIZE),
        };

        let paths_file = file.paths.unwrap_or_default();
        let paths = PathSettings {
            capture_dir: paths_file
                .capture_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_CAPTURE_DIR)),
            detections_dir: paths_file
                .detections_dir
                .unwrap_or_else(|| PathBuf::from(DEFAULT_DETECTIONS_DIR)),
            training_dir: paths_file.training_dir,
        };

        let alerts_file = file.alerts.unwrap_or_default();
        let alerts = AlertSettings {
            recipients: alerts_file.recipients.unwrap_or_default(),
            mqtt: alerts_file.mqtt.map(|mqtt| MqttSettings {
                broker_addr: mqtt.broker_addr,
                topic_prefix: mqtt
                    .topic_prefix
                    .unwrap_or_else(|| DEFAULT_TOPIC_PREFIX.to_string()),
                client_id: mqtt
                    .client_id
                    .unwrap_or_else(|| DEFAULT_CLIENT_ID.to_string()),
                username: mqtt.username,
                password: mqtt.password,
            }),
        };

        Ok(Self {
            cameras,
            stream,
            motion,
            detection,
            paths,
            alerts,
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        self.apply_env_cameras();

        if let Some(value) = env_value("STREAM_RECONNECT_DELAY") {
            self.stream.reconnect_delay = env_secs("STREAM_RECONNECT_DELAY", &value)?;
        }
        if let Some(value) = env_value("FRAME_BUFFER_FLUSH") {
            self.stream.frame_flush = env_parse("FRAME_BUFFER_FLUSH", &value)?;
        }
        if let Some(value) = env_value("MAX_FRAME_BUFFER_SIZE") {
            self.stream.channel_capacity = env_parse("MAX_FRAME_BUFFER_SIZE", &value)?;
        }
        if let Some(value) = env_value("PIXEL_DIFF_THRESHOLD") {
            self.motion.pixel_threshold = env_parse("PIXEL_DIFF_THRESHOLD", &value)?;
        }
        if let Some(value) = env_value("MOTION_AREA_THRESHOLD") {
            self.motion.min_area = env_parse("MOTION_AREA_THRESHOLD", &value)?;
        }
        if let Some(value) = env_value("FRAME_CAPTURE_DELAY") {
            self.detection.stabilization_delay = env_secs("FRAME_CAPTURE_DELAY", &value)?;
        }
        if let Some(value) = env_value("DETECTION_COOLDOWN") {
            self.detection.detection_cooldown = env_secs("DETECTION_COOLDOWN", &value)?;
        }
        if let Some((key, value)) = env_first(&["ALERT_COOLDOWN", "EMAIL_COOLDOWN"]) {
            self.detection.alert_cooldown = env_secs(key, &value)?;
        }
        if let Some(value) = env_value("ALERT_LABELS") {
            self.detection.alert_labels = split_csv(&value).into_iter().collect();
        }
        if let Some(value) = env_value("DETECTION_CLASSES") {
            self.detection.classes = split_csv(&value);
        }
        if let Some(value) = env_value("CONFIDENCE_THRESHOLD") {
            self.detection.confidence_threshold = env_parse("CONFIDENCE_THRESHOLD", &value)?;
        }
        if let Some(value) = env_value("MODEL_PATH") {
            self.detection.model_path = Some(PathBuf::from(value));
        }
        if let Some(value) = env_value("CAPTURE_DIR") {
            self.paths.capture_dir = PathBuf::from(value);
        }
        if let Some(value) = env_value("DETECTIONS_DIR") {
            self.paths.detections_dir = PathBuf::from(value);
        }
        if let Some(value) = env_value("TRAINING_DATA_DIR") {
            self.paths.training_dir = Some(PathBuf::from(value));
        }
        if let Some((_, value)) = env_first(&["ALERT_RECIPIENTS", "ALERT_EMAILS"]) {
            self.alerts.recipients = split_csv(&value);
        }

        if let Some(addr) = env_value("MQTT_BROKER_ADDR") {
            match self.alerts.mqtt.as_mut() {
                Some(mqtt) => mqtt.broker_addr = addr,
                None => self.alerts.mqtt = Some(MqttSettings::new(addr)),
            }
        }
        if let Some(mqtt) = self.alerts.mqtt.as_mut() {
            if let Some(prefix) = env_value("MQTT_TOPIC_PREFIX") {
                mqtt.topic_prefix = prefix;
            }
            if let Some(client_id) = env_value("MQTT_CLIENT_ID") {
                mqtt.client_id = client_id;
            }
            if let Some(username) = env_value("MQTT_USERNAME") {
                mqtt.username = Some(username);
            }
            if let Some(password) = env_value("MQTT_PASSWORD") {
                mqtt.password = Some(password);
            }
        }
        Ok(())
    }

    /// `CAMERA_{i}_URL` (or `CAMERA_{i}_RTSP`) and `CAMERA_{i}_NAME` define
    /// camera `cam{i}`. A file camera with the same id is overridden.
    fn apply_env_cameras(&mut self) {
        for i in 1..=MAX_ENV_CAMERAS {
            let url_keys = [format!("CAMERA_{}_URL", i), format!("CAMERA_{}_RTSP", i)];
            let url = url_keys.iter().find_map(|key| env_value(key));
            let name = env_value(&format!("CAMERA_{}_NAME", i));
            let id = format!("cam{}", i);

            if let Some(existing) = self.cameras.iter_mut().find(|c| c.id == id) {
                if let Some(url) = url {
                    existing.url = url;
                }
                if let Some(name) = name {
                    existing.name = name;
                }
                continue;
            }
            if let Some(url) = url {
                self.cameras.push(CameraSettings {
                    name: name.unwrap_or_else(|| format!("Camera {}", i)),
                    id,
                    url,
                    reconnect_delay: None,
                    frame_flush: None,
                    target_fps: 0,
                });
            }
        }
    }

    fn validate(&mut self) -> Result<()> {
        if self.cameras.is_empty() {
            return Err(invalid(
                "no cameras configured (set CAMERA_1_URL or add cameras to the config file)",
            ));
        }
        let mut seen = BTreeSet::new();
        for camera in &self.cameras {
            crate::storage::validate_camera_id(&camera.id).map_err(|e| invalid(&e.to_string()))?;
            if camera.url.trim().is_empty() {
                return Err(invalid(&format!("camera {} has an empty url", camera.id)));
            }
            if !seen.insert(camera.id.as_str()) {
                return Err(PipelineError::DuplicateCamera(camera.id.clone()).into());
            }
        }
        if self.stream.channel_capacity == 0 {
            return Err(invalid("channel capacity (MAX_FRAME_BUFFER_SIZE) must be greater than zero"));
        }
        let confidence = self.detection.confidence_threshold;
        if !(confidence > 0.0 && confidence <= 1.0) {
            return Err(invalid(&format!(
                "confidence threshold must be in (0, 1], got {}",
                confidence
            )));
        }
        self.detection.alert_labels = normalize_labels(&self.detection.alert_labels);
        self.detection.classes = normalize_labels(&self.detection.classes);
        if self.detection.alert_labels.is_empty() {
            return Err(invalid("at least one alert label is required"));
        }
        if self.detection.input_size == 0 {
            return Err(invalid("model input size must be greater than zero"));
        }
        Ok(())
    }

    pub fn camera_sources(&self) -> Vec<CameraSource> {
        self.cameras
            .iter()
            .map(|camera| {
                CameraSource::new(&camera.id, &camera.name, &camera.url)
                    .with_reconnect_delay(camera.reconnect_delay.unwrap_or(self.stream.reconnect_delay))
                    .with_frame_flush(camera.frame_flush.unwrap_or(self.stream.frame_flush))
                    .with_target_fps(camera.target_fps)
            })
            .collect()
    }

    pub fn multiplexer_options(&self) -> MultiplexerOptions {
        MultiplexerOptions {
            channel_capacity: self.stream.channel_capacity,
            push_timeout: self.stream.push_timeout,
            idle_sleep: self.stream.idle_sleep,
        }
    }

    pub fn orchestrator_config(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            stabilization_delay: self.detection.stabilization_delay,
            detection_cooldown: self.detection.detection_cooldown,
            alert_cooldown: self.detection.alert_cooldown,
            alert_labels: self.detection.alert_labels.clone(),
            recipients: self.alerts.recipients.clone(),
            motion: self.motion,
            ..OrchestratorConfig::default()
        }
    }
}

/// Labels compare against classifier output, which is lower case.
fn normalize_labels<'a, C>(labels: impl IntoIterator<Item = &'a String>) -> C
where
    C: FromIterator<String>,
{
    labels
        .into_iter()
        .map(|label| label.trim().to_lowercase())
        .filter(|label| !label.is_empty())
        .collect()
}

fn invalid(message: &str) -> anyhow::Error {
    PipelineError::InvalidConfig(message.to_string()).into()
}

fn read_config_file(path: &Path) -> Result<CamwatchConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config file {}: {}", path.display(), e))?;
    let cfg = serde_json::from_str(&raw)
        .map_err(|e| anyhow!("invalid config file {}: {}", path.display(), e))?;
    Ok(cfg)
}

/// Non-empty, trimmed value of an environment variable.
fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_first<'a>(keys: &[&'a str]) -> Option<(&'a str, String)> {
    keys.iter()
        .find_map(|key| env_value(key).map(|value| (*key, value)))
}

fn env_parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| anyhow!("{} has an invalid value: {:?}", key, value))
}

fn env_secs(key: &str, value: &str) -> Result<Duration> {
    let secs: f64 = env_parse(key, value)?;
    secs_f64(key, secs)
}

fn secs_f64(key: &str, secs: f64) -> Result<Duration> {
    Duration::try_from_secs_f64(secs)
        .map_err(|_| anyhow!("{} must be a non-negative number of seconds, got {}", key, secs))
}

fn split_csv(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|entry| entry.trim())
        .filter(|entry| !entry.is_empty())
        .map(|entry| entry.to_string())
        .collect()
}
