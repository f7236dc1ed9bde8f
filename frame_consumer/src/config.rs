use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(deserialize_with = "deserialize_log_level")]
    pub log_level: LogLevel,
    #[serde(default)]
    pub display: DisplayConfig,
}

fn deserialize_log_level<'de, D>(deserializer: D) -> Result<LogLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(deserializer)?;
    s.try_into().map_err(serde::de::Error::custom)
}

pub trait Validatable {
    fn validate(&self) -> Result<(), String>;
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    #[serde(default = "default_max_concurrent_streams")]
    pub max_concurrent_streams: u32,
}

fn default_max_concurrent_streams() -> u32 {
    10
}

impl ServerConfig {
    pub fn get_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Validatable for ServerConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_concurrent_streams == 0 {
            return Err("server.max_concurrent_streams must be at least 1".to_string());
        }
        Ok(())
    }
}

/// What happens when a second call streams under a `camera_id` that is
/// already on screen.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SharedCameraPolicy {
    /// Both calls draw on the same surface, last frame wins.
    #[default]
    Share,
    /// The later call fails with `ALREADY_EXISTS`.
    Reject,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DisplayConfig {
    #[serde(default = "default_display_enabled")]
    pub enabled: bool,
    #[serde(default = "default_window_prefix")]
    pub window_prefix: String,
    #[serde(default = "default_quit_key")]
    pub quit_key: char,
    #[serde(default)]
    pub shared_camera_policy: SharedCameraPolicy,
}

fn default_display_enabled() -> bool {
    true
}

fn default_window_prefix() -> String {
    "Side Camera Stream from".to_string()
}

fn default_quit_key() -> char {
    'q'
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            enabled: default_display_enabled(),
            window_prefix: default_window_prefix(),
            quit_key: default_quit_key(),
            shared_camera_policy: SharedCameraPolicy::default(),
        }
    }
}

impl DisplayConfig {
    pub fn window_title(&self, camera_id: &str) -> String {
        format!("{} {}", self.window_prefix, camera_id)
    }
}

impl Validatable for DisplayConfig {
    fn validate(&self) -> Result<(), String> {
        if !self.quit_key.is_ascii_graphic() {
            return Err(format!(
                "display.quit_key must be a printable ASCII character, got {:?}",
                self.quit_key
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub enum Environment {
    Local,
    Production,
}

impl Environment {
    pub fn as_str(&self) -> &'static str {
        match self {
            Environment::Local => "local",
            Environment::Production => "production",
        }
    }
}

impl TryFrom<String> for Environment {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "production" => Ok(Self::Production),
            other => Err(format!(
                "{} is not a supported environment. Use either `local` or `production`.",
                other
            )),
        }
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
        }
    }
}

impl TryFrom<String> for LogLevel {
    type Error = String;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.to_lowercase().as_str() {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            other => Err(format!(
                "{} is not a supported minimum log level. Use either `debug` or `info`.",
                other
            )),
        }
    }
}

pub fn get_configuration() -> Result<Config, config::ConfigError> {
    let base_path = std::env::current_dir().map_err(|e| {
        config::ConfigError::Message(format!("Failed to determine the current directory: {}", e))
    })?;
    let configuration_directory = base_path.join("configuration");

    let environment: Environment = std::env::var("APP_ENVIRONMENT")
        .unwrap_or_else(|_| "local".into())
        .try_into()
        .map_err(config::ConfigError::Message)?;
    let settings = config::Config::builder()
        .add_source(config::File::from(
            configuration_directory.join("base.yaml"),
        ))
        .add_source(
            config::File::from(
                configuration_directory.join(format!("{}.yaml", environment.as_str())),
            )
            .required(false),
        )
        .add_source(
            config::Environment::with_prefix("FC")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    let settings = settings.try_deserialize::<Config>()?;

    for result in [settings.server.validate(), settings.display.validate()] {
        if let Err(e) = result {
            tracing::error!("Configuration validation failed: {}", e);
            return Err(config::ConfigError::Message(e));
        }
    }

    Ok(settings)
}
