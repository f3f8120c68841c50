use crate::models::Act;
use dotenvy::dotenv;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;
use uuid::Uuid;

/// Broker port that never carries TLS.
pub const PLAINTEXT_PORT: u16 = 1883;

const APP_DOCUMENT: &str = "app.json";
const TOPICS_DOCUMENT: &str = "mqtt_topics.json";
const TEXT_DOCUMENT: &str = "text.json";

/// Topic groups whose `WINDOW*` entries are reported as open/closed transitions.
const WINDOW_GROUPS: [&str; 2] = ["Conference", "Multimedia"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Environment variable {0} is missing or invalid.")]
    MissingOrInvalid(String),
    #[error("Parsing error: {0}")]
    ParsingError(String),
    #[error("Unsupported TLS version '{0}', expected 1.2 or 1.3")]
    UnsupportedTlsVersion(String),
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Invalid document {path}: {source}")]
    Document {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TlsVersion {
    None,
    V1_2,
    V1_3,
}

impl TlsVersion {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim() {
            "" => Ok(Self::None),
            "1.2" => Ok(Self::V1_2),
            "1.3" => Ok(Self::V1_3),
            s if s.eq_ignore_ascii_case("none") => Ok(Self::None),
            other => Err(ConfigError::UnsupportedTlsVersion(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Tcp,
    Websockets,
}

impl TransportKind {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "" | "tcp" => Ok(Self::Tcp),
            "websockets" | "ws" => Ok(Self::Websockets),
            other => Err(ConfigError::ParsingError(format!(
                "MQTT_TRANSPORT must be tcp or websockets, got '{}'",
                other
            ))),
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    /// An empty or absent username means anonymous, even when a password is set.
    pub fn resolve(username: Option<String>, password: Option<String>) -> Option<Self> {
        match username {
            Some(username) if !username.is_empty() => Some(Self {
                username,
                password: password.unwrap_or_default(),
            }),
            _ => None,
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Anything outside 0..=2, including garbage, becomes 0.
pub fn normalize_qos(raw: Option<&str>) -> u8 {
    match raw.and_then(|v| v.trim().parse::<i64>().ok()) {
        Some(qos @ 0..=2) => qos as u8,
        _ => 0,
    }
}

fn parse_bool(raw: Option<String>) -> bool {
    raw.map(|v| v.trim().eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn non_empty(raw: Option<String>) -> Option<String> {
    raw.filter(|v| !v.trim().is_empty())
}

fn parse_port(raw: Option<String>, key: &str, default: u16) -> Result<u16, ConfigError> {
    match non_empty(raw) {
        Some(v) => v
            .trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::ParsingError(format!("{} must be a valid port number", key))),
        None => Ok(default),
    }
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub host: String,
    pub port: u16,
    pub transport: TransportKind,
    pub client_id: String,
    pub tls_version: TlsVersion,
    pub tls_ca_path: Option<PathBuf>,
    pub credentials: Option<Credentials>,
    pub qos: u8,
    pub retain: bool,
    pub sync_connect: bool,
    pub keep_alive_secs: u64,
    pub publish_topic_base: String,
    pub subscribe_topic_base: String,
}

impl BrokerConfig {
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // Checked first so a bad TLS version fails before anything else is derived.
        let tls_version = TlsVersion::parse(&lookup("MQTT_TLS_VERSION").unwrap_or_default())?;

        let host = non_empty(lookup("MQTT_BROKER_IP"))
            .ok_or_else(|| ConfigError::MissingOrInvalid("MQTT_BROKER_IP".to_string()))?;
        let port = parse_port(lookup("MQTT_BROKER_PORT"), "MQTT_BROKER_PORT", PLAINTEXT_PORT)?;
        let tls_ca_path = non_empty(lookup("MQTT_TLS_CA_PATH")).map(PathBuf::from);

        if tls_version != TlsVersion::None && port != PLAINTEXT_PORT && tls_ca_path.is_none() {
            return Err(ConfigError::MissingOrInvalid("MQTT_TLS_CA_PATH".to_string()));
        }

        let keep_alive_secs = match non_empty(lookup("MQTT_KEEP_ALIVE_SECS")) {
            Some(v) => v.trim().parse::<u64>().map_err(|_| {
                ConfigError::ParsingError("MQTT_KEEP_ALIVE_SECS must be a valid number".to_string())
            })?,
            None => 60,
        };

        Ok(Self {
            host,
            port,
            transport: TransportKind::parse(&lookup("MQTT_TRANSPORT").unwrap_or_default())?,
            client_id: non_empty(lookup("MQTT_CLIENT_ID"))
                .map(|id| id.trim().to_string())
                .unwrap_or_else(|| format!("pepper-{}", Uuid::new_v4())),
            tls_version,
            tls_ca_path,
            credentials: Credentials::resolve(lookup("MQTT_USERNAME"), lookup("MQTT_PASSWORD")),
            qos: normalize_qos(lookup("MQTT_QOS").as_deref()),
            retain: parse_bool(lookup("MQTT_RETAIN")),
            sync_connect: parse_bool(lookup("MQTT_SYNC_CONNECT")),
            keep_alive_secs,
            publish_topic_base: lookup("MQTT_PUBLISH_TOPIC_BASE").unwrap_or_default(),
            subscribe_topic_base: lookup("MQTT_SUBSCRIBE_TOPIC_BASE").unwrap_or_default(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct RobotConfig {
    pub url: String,
    pub port: u16,
}

#[derive(Clone)]
pub struct SshConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub vlc_path: String,
    pub movie_path: String,
}

impl SshConfig {
    pub fn command(&self) -> String {
        format!("{} {}", self.vlc_path, self.movie_path)
    }
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("command", &self.command())
            .finish()
    }
}

fn default_language() -> String {
    "German".to_string()
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub struct AppToggles {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default)]
    pub projector_automatically: bool,
    #[serde(default)]
    pub lamps_individually: bool,
}

impl Default for AppToggles {
    fn default() -> Self {
        Self {
            language: default_language(),
            projector_automatically: false,
            lamps_individually: false,
        }
    }
}

/// Enabled flag per catalog act. Acts missing from the document stay disabled.
#[derive(Debug, Clone, Copy, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE", default)]
pub struct ActMask {
    pub welcome: bool,
    pub music: bool,
    pub alexa: bool,
    pub roller_shutter: bool,
    pub car_driving_training: bool,
    pub kitchen: bool,
    pub farewell: bool,
}

impl ActMask {
    pub fn is_enabled(&self, act: Act) -> bool {
        match act {
            Act::Welcome => self.welcome,
            Act::Music => self.music,
            Act::Alexa => self.alexa,
            Act::RollerShutter => self.roller_shutter,
            Act::CarDrivingTraining => self.car_driving_training,
            Act::Kitchen => self.kitchen,
            Act::Farewell => self.farewell,
        }
    }

    pub fn from_enabled(acts: &[Act]) -> Self {
        let mut mask = Self::default();
        for act in acts {
            let flag = match act {
                Act::Welcome => &mut mask.welcome,
                Act::Music => &mut mask.music,
                Act::Alexa => &mut mask.alexa,
                Act::RollerShutter => &mut mask.roller_shutter,
                Act::CarDrivingTraining => &mut mask.car_driving_training,
                Act::Kitchen => &mut mask.kitchen,
                Act::Farewell => &mut mask.farewell,
            };
            *flag = true;
        }
        mask
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub config: AppToggles,
    #[serde(default)]
    pub functions: ActMask,
}

/// Group/item tree mapping semantic names to broker item names.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct TopicMap(Value);

impl TopicMap {
    pub fn new(tree: Value) -> Self {
        Self(tree)
    }

    /// Looks up a slash separated path such as `Conference/projector/PROJECTOR`.
    pub fn resolve(&self, path: &str) -> Option<&str> {
        self.0
            .pointer(&format!("/{}", path.trim_start_matches('/')))
            .and_then(Value::as_str)
    }

    pub fn window_items(&self) -> HashSet<String> {
        WINDOW_GROUPS
            .iter()
            .filter_map(|group| self.0.get(group).and_then(Value::as_object))
            .flat_map(|entries| entries.iter())
            .filter(|(key, _)| key.starts_with("WINDOW"))
            .filter_map(|(_, item)| item.as_str())
            .map(str::to_string)
            .collect()
    }
}

/// Presentation script: section name to `LINE_n` sentences.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct ScriptText(HashMap<String, HashMap<String, String>>);

impl ScriptText {
    pub fn line(&self, section: &str, number: usize) -> Option<&str> {
        self.0
            .get(section)?
            .get(&format!("LINE_{}", number))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub debug: bool,
    pub log_dir: PathBuf,
    pub music_url: String,
    pub broker: BrokerConfig,
    pub robot: RobotConfig,
    pub ssh: Option<SshConfig>,
    pub app: AppConfig,
    pub topics: TopicMap,
    pub text: ScriptText,
}

impl Settings {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv().ok(); // Load environment variables from .env file

        let config_dir = env::var("PRESENTER_CONFIG_DIR").unwrap_or_else(|_| "config".to_string());
        Self::load(Path::new(&config_dir), |key| env::var(key).ok())
    }

    pub fn load<F>(config_dir: &Path, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let broker = BrokerConfig::from_lookup(&lookup)?;

        let robot = RobotConfig {
            url: non_empty(lookup("ROBOT_URL")).unwrap_or_else(|| "127.0.0.1".to_string()),
            port: parse_port(lookup("ROBOT_PORT"), "ROBOT_PORT", 9559)?,
        };

        let ssh = match non_empty(lookup("SSH_HOST")) {
            Some(host) => Some(SshConfig {
                host,
                port: parse_port(lookup("SSH_PORT"), "SSH_PORT", 22)?,
                user: lookup("SSH_USER").unwrap_or_default(),
                password: lookup("SSH_PASSWORD").unwrap_or_default(),
                vlc_path: lookup("VLC_PATH").unwrap_or_else(|| "vlc".to_string()),
                movie_path: lookup("MOVIE_PATH").unwrap_or_default(),
            }),
            None => None,
        };

        Ok(Self {
            debug: parse_bool(lookup("DEBUG")),
            log_dir: non_empty(lookup("LOG_DIR"))
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("logs")),
            music_url: lookup("MUSIC_URL").unwrap_or_default(),
            broker,
            robot,
            ssh,
            app: read_document(&config_dir.join(APP_DOCUMENT))?,
            topics: read_document(&config_dir.join(TOPICS_DOCUMENT))?,
            text: read_document(&config_dir.join(TEXT_DOCUMENT))?,
        })
    }
}

fn read_document<T: DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| ConfigError::Document {
        path: path.to_path_buf(),
        source,
    })
}
