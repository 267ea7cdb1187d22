//! Runtime configuration, read from a TOML file when the library is loaded.
//!
//! ```toml
//! layout_path = "/srv/ql/vmhook-layout.json"
//! log_filter = "vmhook=debug"
//! connect_rejection = "Server is locked."
//! configstring_passthrough = [16, [662, 670]]
//! trace_dispatch = false
//! ```

use std::env;
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::dispatch::{DEFAULT_CONNECT_REJECTION, DispatchSettings};
use crate::error::{Error, Result};
use crate::layout::{HostLayout, load_layout};

/// Environment variable naming the config file.
pub const CONFIG_ENV: &str = "VMHOOK_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "vmhook.toml";
pub const DEFAULT_LOG_FILTER: &str = "vmhook=info";

/// One configstring index or a half-open `[start, end]` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexSpec {
    Single(i32),
    Range([i32; 2]),
}

impl IndexSpec {
    pub fn to_range(self) -> Range<i32> {
        match self {
            IndexSpec::Single(index) => index..index.saturating_add(1),
            IndexSpec::Range([start, end]) => start..end,
        }
    }
}

fn default_passthrough() -> Vec<IndexSpec> {
    vec![IndexSpec::Single(16), IndexSpec::Range([662, 670])]
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmhookConfig {
    /// Overrides the layout's target module name.
    pub target_module: Option<String>,
    /// JSON host layout to load at startup.
    pub layout_path: Option<PathBuf>,
    /// `tracing` filter directives; `RUST_LOG` takes precedence.
    pub log_filter: String,
    /// Rejection message for a suppressed connection without one.
    pub connect_rejection: String,
    pub configstring_passthrough: Vec<IndexSpec>,
    /// Log every dispatched event at debug level.
    pub trace_dispatch: bool,
}

impl Default for VmhookConfig {
    fn default() -> Self {
        Self {
            target_module: None,
            layout_path: None,
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            connect_rejection: DEFAULT_CONNECT_REJECTION.to_string(),
            configstring_passthrough: default_passthrough(),
            trace_dispatch: false,
        }
    }
}

impl VmhookConfig {
    pub fn builder() -> VmhookConfigBuilder {
        VmhookConfigBuilder::default()
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    /// Config file named by `VMHOOK_CONFIG`, else `vmhook.toml`. A missing
    /// file yields the defaults.
    pub fn load_default() -> Result<Self> {
        let path = env::var_os(CONFIG_ENV)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
        Self::load_or_default(&path)
    }

    pub fn load_or_default(path: &Path) -> Result<Self> {
        match Self::load(path) {
            Ok(config) => {
                info!("Loaded config from {}", path.display());
                Ok(config)
            }
            Err(e) if e.is_not_found() => {
                warn!("Config {} not found, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e),
        }
    }

    /// Load and validate the configured host layout.
    pub fn host_layout(&self) -> Result<HostLayout> {
        let path = self
            .layout_path
            .as_ref()
            .ok_or_else(|| Error::InvalidLayout("layout_path is not configured".to_string()))?;
        let mut layout = load_layout(path)?;
        if let Some(target) = &self.target_module {
            layout.target_module = target.clone();
        }
        info!(
            "Loaded layout '{}' for module '{}' from {}",
            layout.version,
            layout.target_module,
            path.display()
        );
        layout.validated()
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            configstring_passthrough: self
                .configstring_passthrough
                .iter()
                .map(|spec| spec.to_range())
                .collect(),
            connect_rejection: self.connect_rejection.clone(),
            trace: self.trace_dispatch,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct VmhookConfigBuilder {
    target_module: Option<String>,
    layout_path: Option<PathBuf>,
    log_filter: Option<String>,
    connect_rejection: Option<String>,
    configstring_passthrough: Option<Vec<IndexSpec>>,
    trace_dispatch: Option<bool>,
}

impl VmhookConfigBuilder {
    pub fn target_module(mut self, name: impl Into<String>) -> Self {
        self.target_module = Some(name.into());
        self
    }

    pub fn layout_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.layout_path = Some(path.into());
        self
    }

    pub fn log_filter(mut self, filter: impl Into<String>) -> Self {
        self.log_filter = Some(filter.into());
        self
    }

    pub fn connect_rejection(mut self, message: impl Into<String>) -> Self {
        self.connect_rejection = Some(message.into());
        self
    }

    pub fn configstring_passthrough(mut self, indices: Vec<IndexSpec>) -> Self {
        self.configstring_passthrough = Some(indices);
        self
    }

    pub fn trace_dispatch(mut self, enabled: bool) -> Self {
        self.trace_dispatch = Some(enabled);
        self
    }

    pub fn build(self) -> VmhookConfig {
        let default = VmhookConfig::default();
        VmhookConfig {
            target_module: self.target_module.or(default.target_module),
            layout_path: self.layout_path.or(default.layout_path),
            log_filter: self.log_filter.unwrap_or(default.log_filter),
            connect_rejection: self.connect_rejection.unwrap_or(default.connect_rejection),
            configstring_passthrough: self
                .configstring_passthrough
                .unwrap_or(default.configstring_passthrough),
            trace_dispatch: self.trace_dispatch.unwrap_or(default.trace_dispatch),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::layout::fixtures::complete_layout;
    use crate::layout::save_layout;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_config() {
        let config = VmhookConfig::default();
        assert_eq!(config.log_filter, "vmhook=info");
        assert!(config.layout_path.is_none());
        assert_eq!(
            config.dispatch_settings().configstring_passthrough,
            vec![16..17, 662..670]
        );
    }

    #[test]
    fn test_builder() {
        let config = VmhookConfig::builder()
            .layout_path("layout.json")
            .trace_dispatch(true)
            .connect_rejection("closed")
            .build();

        assert_eq!(config.layout_path, Some(PathBuf::from("layout.json")));
        assert!(config.trace_dispatch);
        assert_eq!(config.dispatch_settings().connect_rejection, "closed");
        assert_eq!(config.log_filter, DEFAULT_LOG_FILTER);
    }

    #[test]
    fn test_load_toml() {
        let mut file = NamedTempFile::new().unwrap();
        write!(
            file,
            r#"
target_module = "qagamex64"
log_filter = "vmhook=trace"
configstring_passthrough = [5, [700, 710]]
"#
        )
        .unwrap();

        let config = VmhookConfig::load(file.path()).unwrap();

        assert_eq!(config.target_module.as_deref(), Some("qagamex64"));
        assert_eq!(config.log_filter, "vmhook=trace");
        assert_eq!(config.connect_rejection, DEFAULT_CONNECT_REJECTION);
        assert_eq!(
            config.dispatch_settings().configstring_passthrough,
            vec![5..6, 700..710]
        );
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = VmhookConfig::load_or_default(Path::new("/nonexistent/vmhook.toml")).unwrap();
        assert_eq!(config, VmhookConfig::default());
    }

    #[test]
    fn test_malformed_file_is_an_error() {
        let mut file = NamedTempFile::new().unwrap();
        write!(file, "trace_dispatch = \"yes\"").unwrap();
        assert!(matches!(
            VmhookConfig::load_or_default(file.path()),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn test_host_layout_applies_target_override() {
        let file = NamedTempFile::new().unwrap();
        save_layout(file.path(), &complete_layout()).unwrap();

        let config = VmhookConfig::builder()
            .layout_path(file.path())
            .target_module("qagamei386")
            .build();
        let layout = config.host_layout().unwrap();

        assert_eq!(layout.target_module, "qagamei386");
    }

    #[test]
    fn test_host_layout_requires_path_and_valid_layout() {
        assert!(VmhookConfig::default().host_layout().is_err());

        let file = NamedTempFile::new().unwrap();
        save_layout(file.path(), &HostLayout::template()).unwrap();
        let config = VmhookConfig::builder().layout_path(file.path()).build();
        assert!(matches!(config.host_layout(), Err(Error::InvalidLayout(_))));
    }
}
