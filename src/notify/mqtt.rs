//! MQTT alert delivery.
//!
//! Publishes a JSON alert to `{prefix}/{camera_id}/alert` and, when the alert
//! carries an attachment, the raw JPEG bytes to `{prefix}/{camera_id}/snapshot`.
//! Both at QoS 1, not retained. Publishes never block: they queue in the
//! client while the event loop reconnects after broker outages.

use anyhow::{anyhow, Context, Result};
use chrono::{SecondsFormat, Utc};
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{Client, Connection, Event, Incoming, MqttOptions};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use super::{Alert, ConversationState, Notifier};
use crate::telemetry::LogSink;

const TARGET: &str = "camwatch::mqtt";

pub const DEFAULT_TOPIC_PREFIX: &str = "camwatch";
pub const DEFAULT_CLIENT_ID: &str = "camwatch";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttSettings {
    /// `host:port`, optionally prefixed with `mqtt://` or `tcp://`.
    pub broker_addr: String,
    pub topic_prefix: String,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl MqttSettings {
    pub fn new(broker_addr: impl Into<String>) -> Self {
        Self {
            broker_addr: broker_addr.into(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            client_id: DEFAULT_CLIENT_ID.to_string(),
            username: None,
            password: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MqttEndpoint {
    pub host: String,
    pub port: u16,
}

/// Parse `[mqtt://|tcp://]host:port`. TLS schemes are rejected.
pub fn parse_mqtt_endpoint(addr: &str) -> Result<MqttEndpoint> {
    let mut remainder = addr.trim();
    if let Some((scheme, rest)) = remainder.split_once("://") {
        match scheme {
            "mqtt" | "tcp" => {}
            "mqtts" | "ssl" => return Err(anyhow!("MQTT over TLS is not supported: {}", addr)),
            other => return Err(anyhow!("unsupported MQTT scheme: {}", other)),
        }
        remainder = rest;
    }

    if let Some(rest) = remainder.strip_prefix('[') {
        let (host, rest) = rest
            .split_once(']')
            .ok_or_else(|| anyhow!("invalid MQTT address: {}", addr))?;
        let port = rest
            .strip_prefix(':')
            .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
        let port: u16 = port.parse().context("invalid MQTT port")?;
        return Ok(MqttEndpoint {
            host: host.to_string(),
            port,
        });
    }

    let (host, port) = remainder
        .rsplit_once(':')
        .ok_or_else(|| anyhow!("missing MQTT port in {}", addr))?;
    if host.is_empty() {
        return Err(anyhow!("missing MQTT host in {}", addr));
    }
    let port: u16 = port.parse().context("invalid MQTT port")?;
    Ok(MqttEndpoint {
        host: host.to_string(),
        port,
    })
}

pub fn alert_topic(prefix: &str, camera_id: &str) -> String {
    format!("{}/{}/alert", prefix.trim_end_matches('/'), camera_id)
}

pub fn snapshot_topic(prefix: &str, camera_id: &str) -> String {
    format!("{}/{}/snapshot", prefix.trim_end_matches('/'), camera_id)
}

#[derive(Debug, Serialize)]
struct AlertPayload<'a> {
    camera_id: &'a str,
    subject: &'a str,
    body: &'a str,
    recipients: &'a [String],
    thread_id: &'a str,
    in_reply_to_thread: bool,
    message_index: u64,
    has_snapshot: bool,
    sent_at: String,
}

fn alert_payload(alert: &Alert, thread_id: &str, conversation: &ConversationState, has_snapshot: bool) -> Result<Vec<u8>> {
    let payload = AlertPayload {
        camera_id: &alert.camera_id,
        subject: &alert.subject,
        body: &alert.body,
        recipients: &alert.recipients,
        thread_id,
        in_reply_to_thread: conversation.is_reply(),
        message_index: conversation.messages_sent() + 1,
        has_snapshot,
        sent_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
    };
    serde_json::to_vec(&payload).context("serialize alert payload")
}

/// Requests the client may queue while the event loop is busy or reconnecting.
pub const REQUEST_QUEUE: usize = 10;
/// Pause between failed broker polls. The next poll reconnects.
pub const RECONNECT_BACKOFF: Duration = Duration::from_secs(2);
const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

/// Owns the client and the thread that drives its event loop.
///
/// Connection errors never end the loop; only `disconnect` does.
struct MqttRuntime {
    client: Client,
    shutdown: Arc<AtomicBool>,
    connection_handle: Option<JoinHandle<()>>,
}

impl MqttRuntime {
    fn new(client: Client, mut connection: Connection, sink: Arc<dyn LogSink>) -> Result<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let stop = shutdown.clone();
        let handle = std::thread::Builder::new()
            .name("mqtt-events".to_string())
            .spawn(move || {
                let mut connected = false;
                for event in connection.iter() {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    match event {
                        Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                            connected = true;
                            sink.info(TARGET, format_args!("MQTT broker connected"));
                        }
                        Ok(Event::Incoming(_)) | Ok(Event::Outgoing(_)) => {}
                        Err(e) => {
                            if connected {
                                sink.warn(TARGET, format_args!("MQTT connection lost: {}", e));
                            } else {
                                sink.warn(TARGET, format_args!("MQTT connection error: {}", e));
                            }
                            connected = false;
                            if wait_or_shutdown(&stop, RECONNECT_BACKOFF) {
                                break;
                            }
                        }
                    }
                }
            })
            .context("spawn MQTT event loop")?;

        Ok(Self {
            client,
            shutdown,
            connection_handle: Some(handle),
        })
    }

    fn is_running(&self) -> bool {
        self.connection_handle
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }

    fn disconnect(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        // Queued only; a loop stuck reconnecting exits on the flag instead.
        let _ = self.client.try_disconnect();
        if let Some(handle) = self.connection_handle.take() {
            let _ = handle.join();
        }
    }
}

/// Sleep up to `total`, returning early with `true` once shutdown is requested.
fn wait_or_shutdown(stop: &AtomicBool, total: Duration) -> bool {
    let deadline = Instant::now() + total;
    while Instant::now() < deadline {
        if stop.load(Ordering::SeqCst) {
            return true;
        }
        std::thread::sleep(SHUTDOWN_POLL.min(deadline.saturating_duration_since(Instant::now())));
    }
    stop.load(Ordering::SeqCst)
}

pub struct MqttNotifier {
    runtime: MqttRuntime,
    settings: MqttSettings,
    sink: Arc<dyn LogSink>,
}

impl MqttNotifier {
    pub fn connect(settings: MqttSettings, sink: Arc<dyn LogSink>) -> Result<Self> {
        let endpoint = parse_mqtt_endpoint(&settings.broker_addr)?;
        let mut options = MqttOptions::new(&settings.client_id, &endpoint.host, endpoint.port);
        options.set_keep_alive(Duration::from_secs(60));
        options.set_clean_start(true);
        if let Some(user) = settings.username.as_deref() {
            options.set_credentials(user, settings.password.as_deref().unwrap_or_default());
        }

        let (client, connection) = Client::new(options, REQUEST_QUEUE);
        sink.info(
            TARGET,
            format_args!(
                "MQTT alerts to {}:{} under {}/ (auth: {})",
                endpoint.host,
                endpoint.port,
                settings.topic_prefix,
                settings.username.is_some()
            ),
        );
        Ok(Self {
            runtime: MqttRuntime::new(client, connection, sink.clone())?,
            settings,
            sink,
        })
    }

    /// True while the event loop thread is alive.
    pub fn is_running(&self) -> bool {
        self.runtime.is_running()
    }

    /// Queue a QoS 1 publish without blocking. While the broker is away the
    /// request waits in the client queue; a full queue is an error.
    fn publish_qos1(&self, topic: &str, payload: Vec<u8>) -> Result<()> {
        self.runtime
            .client
            .try_publish(topic, QoS::AtLeastOnce, false, payload)
            .with_context(|| format!("publish to {} (request queue full or closed)", topic))
    }
}

impl Notifier for MqttNotifier {
    fn name(&self) -> &'static str {
        "mqtt"
    }

    fn deliver(&mut self, alert: &Alert, conversation: &mut ConversationState) -> Result<()> {
        let snapshot = match &alert.attachment {
            Some(path) => match std::fs::read(path) {
                Ok(bytes) => Some(bytes),
                Err(err) => {
                    self.sink.warn(
                        TARGET,
                        format_args!(
                            "attachment {} unreadable, sending text only: {}",
                            path.display(),
                            err
                        ),
                    );
                    None
                }
            },
            None => None,
        };

        let thread_id = conversation.thread_id_or_init().to_string();
        let payload = alert_payload(alert, &thread_id, conversation, snapshot.is_some())?;
        let prefix = &self.settings.topic_prefix;
        self.publish_qos1(&alert_topic(prefix, &alert.camera_id), payload)?;
        if let Some(bytes) = snapshot {
            self.publish_qos1(&snapshot_topic(prefix, &alert.camera_id), bytes)?;
        }
        conversation.record_sent();
        Ok(())
    }
}

impl Drop for MqttNotifier {
    fn drop(&mut self) {
        self.runtime.disconnect();
    }
}
