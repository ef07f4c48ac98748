//! Host settings.
use serde::Deserialize;
use std::{fmt, fs, path::Path, str::FromStr, sync::Arc, time::Duration};
use strum_macros::{AsRefStr, EnumString};

use crate::{constants::DEFAULT_STOP_TIMEOUT, error::ConfigError, fault::Fault};

/// What the host does when the hosted service faults outside a start/stop callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum UnhandledFaultPolicy {
    /// Ignore the fault entirely.
    TakeNoAction,
    /// Log the fault and keep running.
    LogErrorOnly,
    /// Log the fault and, if it terminates the process, stop the service gracefully.
    #[default]
    LogAndTerminate,
}

/// Callback receiving every fault the host observes.
pub type FaultCallback = Arc<dyn Fn(&Fault) + Send + Sync>;

/// Settings consumed by the host runtime.
#[derive(Clone)]
pub struct HostSettings {
    /// Name used in log lines.
    pub service_name: String,
    /// Human-readable name; also used as the console title.
    pub display_name: String,
    pub description: String,
    /// How long a graceful stop may take.
    pub stop_timeout: Duration,
    /// Invoked for start/stop failures and unhandled faults.
    pub fault_callback: Option<FaultCallback>,
    pub unhandled_fault_policy: UnhandledFaultPolicy,
    /// When false, Ctrl-Break kills the process instead of stopping the service.
    pub can_handle_ctrl_break: bool,
    /// Exit the process if the graceful stop times out instead of waiting on a hung
    /// stop callback.
    pub force_exit_on_stop_timeout: bool,
    /// Arguments the program was launched with, without any service-wrapper prefix.
    pub command_line: Option<String>,
}

impl HostSettings {
    /// Settings with defaults for everything but the service name.
    pub fn new(service_name: impl Into<String>) -> Self {
        let service_name = service_name.into();
        Self {
            display_name: service_name.clone(),
            service_name,
            description: String::new(),
            stop_timeout: DEFAULT_STOP_TIMEOUT,
            fault_callback: None,
            unhandled_fault_policy: UnhandledFaultPolicy::default(),
            can_handle_ctrl_break: true,
            force_exit_on_stop_timeout: true,
            command_line: None,
        }
    }

    pub fn with_stop_timeout(mut self, stop_timeout: Duration) -> Self {
        self.stop_timeout = stop_timeout;
        self
    }

    pub fn with_policy(mut self, policy: UnhandledFaultPolicy) -> Self {
        self.unhandled_fault_policy = policy;
        self
    }

    pub fn with_fault_callback<F>(mut self, callback: F) -> Self
    where
        F: Fn(&Fault) + Send + Sync + 'static,
    {
        self.fault_callback = Some(Arc::new(callback));
        self
    }

    pub fn with_force_exit_on_stop_timeout(mut self, force: bool) -> Self {
        self.force_exit_on_stop_timeout = force;
        self
    }

    /// Invokes the fault callback, if any.
    pub(crate) fn report_fault(&self, fault: &Fault) {
        if let Some(callback) = &self.fault_callback {
            callback(fault);
        }
    }
}

impl fmt::Debug for HostSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostSettings")
            .field("service_name", &self.service_name)
            .field("display_name", &self.display_name)
            .field("description", &self.description)
            .field("stop_timeout", &self.stop_timeout)
            .field("fault_callback", &self.fault_callback.is_some())
            .field("unhandled_fault_policy", &self.unhandled_fault_policy)
            .field("can_handle_ctrl_break", &self.can_handle_ctrl_break)
            .field(
                "force_exit_on_stop_timeout",
                &self.force_exit_on_stop_timeout,
            )
            .field("command_line", &self.command_line)
            .finish()
    }
}

/// On-disk representation of [`HostSettings`].
#[derive(Debug, Deserialize)]
pub struct SettingsFile {
    pub service_name: String,
    pub display_name: Option<String>,
    pub description: Option<String>,
    /// Duration such as `30s`, `500ms` or `2m`.
    pub stop_timeout: Option<String>,
    /// One of `take_no_action`, `log_error_only`, `log_and_terminate`.
    pub unhandled_fault_policy: Option<String>,
    pub can_handle_ctrl_break: Option<bool>,
    pub force_exit_on_stop_timeout: Option<bool>,
}

impl TryFrom<SettingsFile> for HostSettings {
    type Error = ConfigError;

    fn try_from(file: SettingsFile) -> Result<Self, Self::Error> {
        let mut settings = HostSettings::new(file.service_name);

        if let Some(display_name) = file.display_name {
            settings.display_name = display_name;
        }
        if let Some(description) = file.description {
            settings.description = description;
        }
        if let Some(raw) = file.stop_timeout {
            settings.stop_timeout = parse_duration(&raw)?;
        }
        if let Some(raw) = file.unhandled_fault_policy {
            settings.unhandled_fault_policy = UnhandledFaultPolicy::from_str(raw.trim())
                .map_err(|_| ConfigError::InvalidPolicy(raw))?;
        }
        if let Some(flag) = file.can_handle_ctrl_break {
            settings.can_handle_ctrl_break = flag;
        }
        if let Some(flag) = file.force_exit_on_stop_timeout {
            settings.force_exit_on_stop_timeout = flag;
        }

        Ok(settings)
    }
}

/// Loads host settings from a YAML file.
pub fn load_settings(path: &Path) -> Result<HostSettings, ConfigError> {
    let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;

    let file: SettingsFile = serde_yaml::from_str(&content)?;
    HostSettings::try_from(file)
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ConfigError::InvalidDuration(raw.to_string()));
    }

    let invalid = || ConfigError::InvalidDuration(raw.to_string());

    if let Some(stripped) = value.strip_suffix("ms") {
        let amount: u64 = stripped.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}
