//! Typed operations on the peer application.
//!
//! Each method maps onto one remote command. Failures of the link or of the
//! command are logged and reported as `None`/`false`, so callers treat them
//! the same way as a timeout: the answer is unknown.

use crate::client::{BridgeClient, BridgeError};
use crate::params;
use crate::protocol::Params;
use harmony_core::{normalize_path, Config, Endpoint, TtlCache};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::cell::RefCell;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Name reported in [`HostInfo`].
pub const HOST_NAME: &str = "Harmony";

/// Oldest `major.minor` release the integration supports.
pub const MIN_SUPPORTED_VERSION: f64 = 16.0;

const UNKNOWN: &str = "Unknown";

type CacheKey = (String, String);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRange {
    pub start_frame: i64,
    pub stop_frame: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostInfo {
    pub name: String,
    pub version: String,
}

/// How a running release compares with the supported range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Compatibility {
    /// Older than [`MIN_SUPPORTED_VERSION`].
    Unsupported { version: f64 },
    Supported,
    /// Newer than anything tested.
    Untested { version: f64 },
}

impl Compatibility {
    /// Classify a version string such as `"22.0.1"` by its `major.minor`.
    pub fn classify(version: &str) -> Option<Self> {
        let mut parts = version.trim().split('.');
        let major = parts.next()?.trim();
        if major.is_empty() || !major.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let minor = parts.next().map(str::trim).unwrap_or("0");
        let version: f64 = format!("{major}.{minor}").parse().ok()?;

        Some(if version < MIN_SUPPORTED_VERSION {
            Self::Unsupported { version }
        } else if version > MIN_SUPPORTED_VERSION {
            Self::Untested { version }
        } else {
            Self::Supported
        })
    }
}

impl fmt::Display for Compatibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unsupported { version } => write!(
                f,
                "version {version:.1} is older than the minimum supported {MIN_SUPPORTED_VERSION:.1}"
            ),
            Self::Supported => write!(f, "supported"),
            Self::Untested { version } => write!(
                f,
                "version {version:.1} is newer than {MIN_SUPPORTED_VERSION:.1} and not fully tested"
            ),
        }
    }
}

/// Kind of file brought into the open scene.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Drawing,
    ThreeD,
    Sound,
    Movie,
}

impl ResourceKind {
    fn command(self) -> &'static str {
        match self {
            Self::Drawing | Self::ThreeD => "IMPORT_DRAWING",
            Self::Sound => "IMPORT_AUDIO",
            Self::Movie => "IMPORT_CLIP",
        }
    }
}

#[derive(Debug, Error)]
#[error("unknown resource kind: {0}")]
pub struct UnknownResourceKind(pub String);

impl FromStr for ResourceKind {
    type Err = UnknownResourceKind;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "drawing" => Ok(Self::Drawing),
            "3d" => Ok(Self::ThreeD),
            "sound" => Ok(Self::Sound),
            "movie" => Ok(Self::Movie),
            other => Err(UnknownResourceKind(other.to_string())),
        }
    }
}

/// Arguments of a QuickTime render.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RenderOptions {
    pub location: String,
    pub start_frame: i64,
    pub end_frame: i64,
    pub with_sound: bool,
    pub res_x: u32,
    pub res_y: u32,
    pub generate_thumbnail: bool,
    pub thumbnail_frame: i64,
}

/// The peer application, seen through a [`BridgeClient`].
pub struct Application {
    client: BridgeClient,
    retry_interval: Duration,
    max_connect_attempts: Option<u32>,
    cache: RefCell<TtlCache<CacheKey, Value>>,
}

impl Application {
    pub fn new(client: BridgeClient, config: &Config) -> Self {
        tracing::debug!("started application");
        Self {
            client,
            retry_interval: config.bridge.retry_interval(),
            max_connect_attempts: config.bridge.max_connect_attempts,
            cache: RefCell::new(TtlCache::new(config.cache.ttl(), config.cache.capacity)),
        }
    }

    /// Application reached over TCP at `endpoint`. Does not connect yet.
    pub fn tcp(endpoint: &Endpoint, config: &Config) -> Self {
        Self::new(BridgeClient::tcp(endpoint, &config.bridge), config)
    }

    pub fn client(&self) -> &BridgeClient {
        &self.client
    }

    /// Connect, retrying at a fixed interval until the peer accepts or the
    /// configured attempt limit runs out.
    pub fn connect(&self) -> Result<(), BridgeError> {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            match self.client.connect() {
                Ok(_) => break,
                Err(e) if self.max_connect_attempts.is_some_and(|max| attempts >= max) => {
                    tracing::error!(attempts, error = %e, "giving up connecting to server");
                    return Err(e);
                }
                Err(e) => {
                    tracing::debug!(attempts, error = %e, "waiting for server");
                    self.client.wait(self.retry_interval);
                }
            }
        }

        if let Some(commands) = self.list_commands() {
            tracing::debug!(count = commands.len(), ?commands, "peer commands");
        }
        Ok(())
    }

    /// Drop cached answers, e.g. after the peer restarted.
    pub fn clear_cache(&self) {
        self.cache.borrow_mut().clear();
    }

    pub fn broadcast_event(&self, event_name: &str) -> bool {
        self.send(event_name, Params::new())
    }

    pub fn log_info(&self, message: &str) -> bool {
        self.send("LOG_INFO", params! { "message" => message })
    }

    pub fn log_warning(&self, message: &str) -> bool {
        self.send("LOG_WARNING", params! { "message" => message })
    }

    pub fn log_debug(&self, message: &str) -> bool {
        self.send("LOG_DEBUG", params! { "message" => message })
    }

    pub fn log_error(&self, message: &str) -> bool {
        self.send("LOG_ERROR", params! { "message" => message })
    }

    pub fn log_exception(&self, message: &str) -> bool {
        self.send("LOG_EXCEPTION", params! { "message" => message })
    }

    pub fn toggle_debug_logging(&self, enabled: bool) -> bool {
        self.send("TOGGLE_DEBUG_LOGGING", params! { "enabled" => enabled })
    }

    /// Release string of the peer, cached after the first answer.
    pub fn application_version(&self) -> Option<String> {
        self.cached_query("GET_VERSION", Params::new())
            .map(|version| value_to_string(&version))
    }

    pub fn host_info(&self) -> HostInfo {
        HostInfo {
            name: HOST_NAME.to_string(),
            version: self
                .application_version()
                .unwrap_or_else(|| "unknown".to_string()),
        }
    }

    pub fn check_compatibility(&self) -> Option<Compatibility> {
        let version = self.application_version()?;
        let compatibility = Compatibility::classify(&version);
        if compatibility.is_none() {
            tracing::warn!(%version, "could not parse application version");
        }
        compatibility
    }

    /// Path of the open project, or `"Unknown"` when the peer has none.
    pub fn current_project_path(&self) -> String {
        self.query_path("GET_CURRENT_PROJECT_PATH", Params::new())
            .unwrap_or_else(|| UNKNOWN.to_string())
    }

    pub fn open_project(&self, path: &str) -> Option<String> {
        let path = normalize_path(path);
        self.query_path("OPEN_PROJECT", params! { "path" => path })
    }

    pub fn save_project(&self) -> Option<String> {
        self.query_path("SAVE_PROJECT", Params::new())
    }

    pub fn needs_saving(&self, path: &str) -> Option<bool> {
        self.query("NEEDS_SAVING", params! { "path" => path })
            .map(|value| crate::dispatcher::is_truthy(&value))
    }

    pub fn save_new_version(&self, version_name: &str) -> Option<String> {
        self.query_path(
            "SAVE_NEW_VERSION",
            params! { "version_name" => version_name },
        )
    }

    pub fn save_new_version_action(&self) -> Option<Value> {
        self.query("SAVE_NEW_VERSION_ACTION", Params::new())
    }

    pub fn current_version_name(&self) -> Option<String> {
        self.query("CURRENT_VERSION_NAME", Params::new())
            .filter(crate::dispatcher::is_truthy)
            .map(|value| value_to_string(&value))
    }

    pub fn is_startup_project(&self) -> Option<bool> {
        self.query("IS_STARTUP_PROJECT", Params::new())
            .map(|value| crate::dispatcher::is_truthy(&value))
    }

    /// Evaluate a script statement inside the peer.
    pub fn execute(&self, statement: &str) -> Option<Value> {
        self.query("EXECUTE_STATEMENT", params! { "statement" => statement })
    }

    pub fn extract_thumbnail(&self, path: &str) -> Option<Value> {
        self.query("EXTRACT_THUMBNAIL", params! { "path" => path })
    }

    pub fn render_image_sequence(&self) -> Option<Value> {
        self.query("RENDER_IMAGE_SEQUENCE", Params::new())
    }

    /// Start a QuickTime render. The peer does not answer this one.
    pub fn render_to_quicktime(&self, options: &RenderOptions) -> bool {
        tracing::debug!(location = %options.location, "rendering to quicktime movie");
        match serde_json::to_value(options) {
            Ok(Value::Object(params)) => self.send("RENDER_TO_QUICKTIME", params),
            Ok(_) => false,
            Err(e) => {
                tracing::error!(error = %e, "could not encode render options");
                false
            }
        }
    }

    pub fn start_frame(&self) -> Option<i64> {
        self.query_as("GET_START_FRAME", Params::new())
    }

    pub fn set_start_frame(&self, start_frame: i64) -> Option<Value> {
        self.query("SET_START_FRAME", params! { "start_frame" => start_frame })
    }

    pub fn stop_frame(&self) -> Option<i64> {
        self.query_as("GET_STOP_FRAME", Params::new())
    }

    pub fn set_stop_frame(&self, stop_frame: i64) -> Option<Value> {
        self.query("SET_STOP_FRAME", params! { "stop_frame" => stop_frame })
    }

    pub fn frame_range(&self) -> Option<FrameRange> {
        self.query_as("GET_FRAME_RANGE", Params::new())
    }

    pub fn set_frame_range(&self, range: FrameRange) -> Option<Value> {
        self.query(
            "SET_FRAME_RANGE",
            params! { "start_frame" => range.start_frame, "stop_frame" => range.stop_frame },
        )
    }

    pub fn frame_count(&self) -> Option<i64> {
        self.query_as("GET_FRAME_COUNT", Params::new())
    }

    pub fn set_frame_count(&self, frame_count: i64) -> Option<Value> {
        self.query("SET_FRAME_COUNT", params! { "frame_count" => frame_count })
    }

    /// Bring a file into the scene. The peer does not answer imports.
    pub fn import_project_resource(&self, path: &str, kind: ResourceKind) -> bool {
        let path = path.replace('\\', "/");
        self.send(kind.command(), params! { "path" => path })
    }

    pub fn nodes_of_type(&self, node_types: &[&str]) -> Option<Vec<String>> {
        self.query_as("GET_NODES_OF_TYPE", params! { "node_types" => node_types })
    }

    pub fn node_metadata(&self, node: &str, attr_name: &str) -> Option<Value> {
        self.query(
            "GET_NODE_METADATA",
            params! { "node" => node, "attr_name" => attr_name },
        )
    }

    pub fn scene_metadata(&self, attr_name: &str) -> Option<Value> {
        self.query("GET_SCENE_METADATA", params! { "attr_name" => attr_name })
    }

    pub fn columns_of_type(&self, column_type: &str) -> Option<Vec<String>> {
        self.query_as("GET_COLUMNS_OF_TYPE", params! { "column_type" => column_type })
    }

    pub fn sound_column_filenames(&self, column_name: &str) -> Option<Vec<String>> {
        self.query_as(
            "GET_SOUND_COLUMN_FILENAMES",
            params! { "column_name" => column_name },
        )
    }

    /// Commands the peer understands.
    pub fn list_commands(&self) -> Option<Vec<String>> {
        self.query_as("DIR", Params::new())
    }

    fn send(&self, method: &str, params: Params) -> bool {
        match self.client.notify(method, params) {
            Ok(_) => true,
            Err(e) => {
                tracing::error!(method, error = %e, "could not send command");
                false
            }
        }
    }

    fn query(&self, method: &str, params: Params) -> Option<Value> {
        match self.client.call_and_wait(method, params) {
            Ok(value) => value,
            Err(e) => {
                tracing::error!(method, error = %e, "command failed");
                None
            }
        }
    }

    fn query_as<T: DeserializeOwned>(&self, method: &str, params: Params) -> Option<T> {
        let value = self.query(method, params)?;
        match serde_json::from_value(value) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!(method, error = %e, "unexpected result shape");
                None
            }
        }
    }

    fn query_path(&self, method: &str, params: Params) -> Option<String> {
        self.query(method, params)
            .filter(crate::dispatcher::is_truthy)
            .map(|value| normalize_path(value_to_string(&value)))
    }

    fn cached_query(&self, method: &str, params: Params) -> Option<Value> {
        let key = (method.to_string(), Value::Object(params.clone()).to_string());
        if let Some(value) = self.cache.borrow_mut().get(&key) {
            tracing::trace!(method, "answered from cache");
            return Some(value);
        }

        let value = self.query(method, params)?;
        self.cache.borrow_mut().insert(key, value.clone());
        Some(value)
    }
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::tests::{memory_client, respond_with, Wire};
    use crate::protocol::Message;
    use crate::transport::TransportError;
    use serde_json::json;
    use std::cell::Cell;
    use std::rc::Rc;

    fn application() -> (Application, Rc<RefCell<Wire>>) {
        let (client, wire) = memory_client();
        (Application::new(client, &Config::default()), wire)
    }

    fn answer(wire: &Rc<RefCell<Wire>>, method: &'static str, result: Value) {
        respond_with(wire, move |message| match message {
            Message::Call(call) if call.method == method => {
                vec![Message::reply(call.id.clone(), result.clone())]
            }
            _ => Vec::new(),
        });
    }

    fn sent_calls(wire: &Rc<RefCell<Wire>>) -> Vec<(String, Params, bool)> {
        wire.borrow()
            .outbound
            .iter()
            .filter_map(|message| match message {
                Message::Call(call) => Some((
                    call.method.clone(),
                    call.params.clone(),
                    call.request_return,
                )),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn connect_retries_keep_pumping_events() {
        let (client, wire) = memory_client();
        let mut config = Config::default();
        config.bridge.retry_interval_ms = 10;
        config.bridge.max_connect_attempts = Some(3);
        let app = Application::new(client, &config);

        let pumps = Rc::new(Cell::new(0));
        let counter = pumps.clone();
        app.client()
            .set_event_pump(move || counter.set(counter.get() + 1));
        wire.borrow_mut().connected = false;
        wire.borrow_mut().refuse_connects = usize::MAX;

        let err = app.connect().expect_err("every attempt refused");
        assert!(matches!(
            err,
            BridgeError::Transport(TransportError::ConnectFailed { .. })
        ));
        assert_eq!(wire.borrow().refuse_connects, usize::MAX - 3);
        // two pauses of 10ms in 2ms slices
        assert!(pumps.get() >= 4, "pumped {} times", pumps.get());
    }

    #[test]
    fn connect_succeeds_after_refusals() {
        let (client, wire) = memory_client();
        let mut config = Config::default();
        config.bridge.retry_interval_ms = 5;
        let app = Application::new(client, &config);
        answer(&wire, "DIR", json!(["DIR"]));
        wire.borrow_mut().refuse_connects = 2;

        app.connect().unwrap();
        assert_eq!(wire.borrow().connects, 1);
        assert_eq!(sent_calls(&wire)[0].0, "DIR");
    }

    #[test]
    fn classifies_versions() {
        assert_eq!(
            Compatibility::classify("15.0.3"),
            Some(Compatibility::Unsupported { version: 15.0 })
        );
        assert_eq!(Compatibility::classify("16.0"), Some(Compatibility::Supported));
        assert_eq!(
            Compatibility::classify("22.0.1"),
            Some(Compatibility::Untested { version: 22.0 })
        );
        assert_eq!(
            Compatibility::classify("16.1"),
            Some(Compatibility::Untested { version: 16.1 })
        );
        assert_eq!(Compatibility::classify("16"), Some(Compatibility::Supported));
        assert_eq!(Compatibility::classify("beta"), None);
    }

    #[test]
    fn resource_kinds_parse() {
        assert_eq!("3d".parse::<ResourceKind>().unwrap(), ResourceKind::ThreeD);
        assert_eq!("movie".parse::<ResourceKind>().unwrap(), ResourceKind::Movie);
        assert!("texture".parse::<ResourceKind>().is_err());
    }

    #[test]
    fn frame_range_is_typed() {
        let (app, wire) = application();
        answer(&wire, "GET_FRAME_RANGE", json!({"start_frame": 1, "stop_frame": 48}));

        assert_eq!(
            app.frame_range(),
            Some(FrameRange {
                start_frame: 1,
                stop_frame: 48
            })
        );
    }

    #[test]
    fn set_frame_range_sends_both_bounds() {
        let (app, wire) = application();
        answer(&wire, "SET_FRAME_RANGE", json!(true));

        let result = app.set_frame_range(FrameRange {
            start_frame: 101,
            stop_frame: 148,
        });
        assert_eq!(result, Some(json!(true)));

        let calls = sent_calls(&wire);
        assert_eq!(calls[0].0, "SET_FRAME_RANGE");
        assert_eq!(calls[0].1["start_frame"], json!(101));
        assert_eq!(calls[0].1["stop_frame"], json!(148));
        assert!(calls[0].2);
    }

    #[test]
    fn version_is_cached() {
        let (app, wire) = application();
        let asked = Rc::new(Cell::new(0));
        let counter = asked.clone();
        respond_with(&wire, move |message| {
            counter.set(counter.get() + 1);
            vec![Message::reply(message.id().clone(), json!("22.0.1"))]
        });

        assert_eq!(app.application_version().as_deref(), Some("22.0.1"));
        assert_eq!(app.host_info().version, "22.0.1");
        assert_eq!(
            app.check_compatibility(),
            Some(Compatibility::Untested { version: 22.0 })
        );
        assert_eq!(asked.get(), 1);

        app.clear_cache();
        app.application_version();
        assert_eq!(asked.get(), 2);
    }

    #[test]
    fn project_path_falls_back_to_unknown() {
        let (app, wire) = application();
        answer(&wire, "GET_CURRENT_PROJECT_PATH", Value::Null);

        assert_eq!(app.current_project_path(), "Unknown");
    }

    #[test]
    fn remote_failure_reads_as_unknown() {
        let (app, wire) = application();
        respond_with(&wire, |message| {
            vec![Message::error(message.id().clone(), "no project")]
        });

        assert_eq!(app.save_project(), None);
        assert_eq!(app.host_info().version, "unknown");
    }

    #[test]
    fn imports_use_forward_slashes_and_do_not_wait() {
        let (app, wire) = application();

        assert!(app.import_project_resource(r"C:\shots\bg.psd", ResourceKind::Drawing));
        assert!(app.import_project_resource("/shots/dialog.wav", ResourceKind::Sound));
        assert!(app.import_project_resource("/shots/ref.mov", ResourceKind::Movie));

        let calls = sent_calls(&wire);
        let methods: Vec<&str> = calls.iter().map(|(method, _, _)| method.as_str()).collect();
        assert_eq!(methods, vec!["IMPORT_DRAWING", "IMPORT_AUDIO", "IMPORT_CLIP"]);
        assert_eq!(calls[0].1["path"], json!("C:/shots/bg.psd"));
        assert!(calls.iter().all(|(_, _, request_return)| !request_return));
    }

    #[test]
    fn render_options_become_params() {
        let (app, wire) = application();
        let options = RenderOptions {
            location: "/renders/ep01.mov".to_string(),
            start_frame: 1,
            end_frame: 48,
            with_sound: true,
            res_x: 1920,
            res_y: 1080,
            generate_thumbnail: false,
            thumbnail_frame: 1,
        };

        assert!(app.render_to_quicktime(&options));
        let calls = sent_calls(&wire);
        assert_eq!(calls[0].0, "RENDER_TO_QUICKTIME");
        assert_eq!(calls[0].1["res_x"], json!(1920));
        assert_eq!(calls[0].1["with_sound"], json!(true));
        assert_eq!(calls[0].1.len(), 8);
    }

    #[test]
    fn log_messages_are_fire_and_forget() {
        let (app, wire) = application();
        assert!(app.log_warning("disk almost full"));
        assert!(app.toggle_debug_logging(true));

        let calls = sent_calls(&wire);
        assert_eq!(calls[0].0, "LOG_WARNING");
        assert_eq!(calls[0].1["message"], json!("disk almost full"));
        assert_eq!(calls[1].1["enabled"], json!(true));
    }

    #[test]
    fn list_commands_reads_dir() {
        let (app, wire) = application();
        answer(&wire, "DIR", json!(["DIR", "GET_VERSION", "PING"]));

        assert_eq!(
            app.list_commands(),
            Some(vec![
                "DIR".to_string(),
                "GET_VERSION".to_string(),
                "PING".to_string()
            ])
        );
    }

    #[test]
    fn unexpected_shape_is_none() {
        let (app, wire) = application();
        answer(&wire, "GET_FRAME_COUNT", json!("lots"));

        assert_eq!(app.frame_count(), None);
    }
}
