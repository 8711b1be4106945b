use thiserror::Error;

/// Internal switch fault. Always answered with an emergency resume.
#[derive(Debug, Error)]
pub enum SwitchError {
    #[error("scheduling control failed: {0}")]
    Control(String),

    #[error("switch step panicked: {0}")]
    Panicked(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
