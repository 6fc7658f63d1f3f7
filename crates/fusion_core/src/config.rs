//! # Fusion Configuration
//!
//! Process-wide options, read once when a registry is built and shared
//! immutably afterwards.
//!
//! Two sources are supported:
//! - TOML files (kebab-case keys, see [`FusionConfig::from_toml_str`])
//! - option strings in the classic `name=value` / `no-name` form, comma
//!   separated (see [`FusionConfig::parse_options`])

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{FusionError, FusionResult};
use crate::sync::MAX_WAIT;

/// Which references are traced at `trace` level.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum TraceRef {
    /// No reference tracing.
    #[default]
    Off,
    /// Trace every reference.
    All,
    /// Trace one reference id.
    Id(u64),
}

impl TraceRef {
    /// Returns true if the reference with this id is traced.
    #[inline]
    #[must_use]
    pub const fn matches(self, id: u64) -> bool {
        match self {
            Self::Off => false,
            Self::All => true,
            Self::Id(traced) => traced == id,
        }
    }
}

impl TryFrom<String> for TraceRef {
    type Error = FusionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        if value.eq_ignore_ascii_case("all") {
            return Ok(Self::All);
        }
        if value.is_empty() || value.eq_ignore_ascii_case("off") {
            return Ok(Self::Off);
        }
        let digits = value.trim_start_matches("0x");
        u64::from_str_radix(digits, 16)
            .map(Self::Id)
            .map_err(|_| FusionError::Config(format!("trace-ref: '{value}' is not a hex id")))
    }
}

/// Process-wide Fusion configuration.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct FusionConfig {
    /// Directory holding shared memory files (auto: `/dev/shm`, else temp dir).
    pub tmpfs: Option<PathBuf>,
    /// Numeric group id that should own shared memory files.
    pub shmfile_group: Option<u32>,
    /// Always enter as a slave, waiting for the master if not there.
    pub force_slave: bool,
    /// Register fork handlers.
    pub fork_handler: bool,
    /// Enable shared memory allocation tracking for every pool.
    pub debugshm: bool,
    /// Discard freed pool memory right away.
    pub madv_remove: bool,
    /// Only owners and granted processes may attach pools.
    pub secure_fusion: bool,
    /// Reclaim destroyed objects in batches instead of immediately.
    pub defer_destructors: bool,
    /// Batch size for deferred destruction.
    pub destructor_batch: usize,
    /// Reference tracing.
    pub trace_ref: TraceRef,
    /// Maximum queued one-way calls per call bin (0 disables call bins).
    pub call_bin_max_num: usize,
    /// Maximum payload bytes per call bin.
    pub call_bin_max_data: usize,
    /// Dump objects from all pools if some remain alive at pool destruction.
    pub shutdown_info: bool,
    /// Default deadline for synchronous calls (ms).
    pub call_timeout_ms: u64,
    /// How often a timed out call is resent (0 = never, the default).
    pub call_retry_attempts: u32,
    /// Pause before resending a timed out call (ms).
    pub call_retry_backoff_ms: u64,
    /// Bound of each reactor listener queue.
    pub reactor_queue_depth: usize,
    /// Master liveness sweep and dispatcher tick period (ms).
    pub liveness_interval_ms: u64,
    /// Deadline for joining a world (ms).
    pub join_timeout_ms: u64,
}

impl Default for FusionConfig {
    fn default() -> Self {
        Self {
            tmpfs: None,
            shmfile_group: None,
            force_slave: false,
            fork_handler: false,
            debugshm: false,
            madv_remove: false,
            secure_fusion: false,
            defer_destructors: false,
            destructor_batch: 16,
            trace_ref: TraceRef::Off,
            call_bin_max_num: 512,
            call_bin_max_data: 65536,
            shutdown_info: false,
            call_timeout_ms: 5_000,
            call_retry_attempts: 0,
            call_retry_backoff_ms: 10,
            reactor_queue_depth: 64,
            liveness_interval_ms: 20,
            join_timeout_ms: 2_000,
        }
    }
}

/// Help text for the option-string syntax.
pub const CONFIG_USAGE: &str = "\
fusion options:
  tmpfs=<directory>              Location of shared memory files (default = auto)
  shmfile-group=<gid>            Group that owns shared memory files
  [no-]force-slave               Always enter as a slave, waiting for the master
  [no-]fork-handler              Register fork handlers
  [no-]debugshm                  Enable shared memory allocation tracking
  [no-]madv-remove               Discard freed pool memory right away
  [no-]secure-fusion             Restrict pool attachment to granted processes
  [no-]defer-destructors         Reclaim destroyed objects in batches
  destructor-batch=<n>           Batch size for deferred destruction (default = 16)
  trace-ref=<hexid>              Trace FusionRef up/down ('all' traces all)
  call-bin-max-num=<n>           Maximum queued one-way calls (default = 512, 0 = disable)
  call-bin-max-data=<n>          Maximum queued one-way call data (default = 65536)
  [no-]shutdown-info             Dump objects remaining at pool destruction
  call-timeout-ms=<n>            Deadline for synchronous calls (default = 5000)
  call-retry-attempts=<n>        Resends of timed out calls (default = 0)
  call-retry-backoff-ms=<n>      Pause before a resend (default = 10)
  reactor-queue-depth=<n>        Reactor listener queue bound (default = 64)
  liveness-interval-ms=<n>       Liveness sweep period (default = 20)
  join-timeout-ms=<n>            Deadline for joining a world (default = 2000)
";

impl FusionConfig {
    /// Parses a TOML document.
    ///
    /// # Errors
    ///
    /// Returns [`FusionError::Config`] for malformed input or unknown keys.
    pub fn from_toml_str(text: &str) -> FusionResult<Self> {
        let config: Self = toml::from_str(text).map_err(|e| FusionError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file.
    ///
    /// # Errors
    ///
    /// Returns [`FusionError::Io`] if the file cannot be read.
    pub fn from_toml_file(path: impl AsRef<std::path::Path>) -> FusionResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Parses a comma separated option string on top of the defaults.
    ///
    /// # Errors
    ///
    /// Returns [`FusionError::Config`] for unknown options or bad values.
    pub fn parse_options(options: &str) -> FusionResult<Self> {
        let mut config = Self::default();
        for option in options.split(',').map(str::trim).filter(|o| !o.is_empty()) {
            match option.split_once('=') {
                Some((name, value)) => config.set(name.trim(), Some(value.trim()))?,
                None => config.set(option, None)?,
            }
        }
        config.validate()?;
        Ok(config)
    }

    /// Applies a single option.
    ///
    /// # Errors
    ///
    /// Returns [`FusionError::Config`] for unknown options or bad values.
    pub fn set(&mut self, name: &str, value: Option<&str>) -> FusionResult<()> {
        let (flag, name) = match name.strip_prefix("no-") {
            Some(rest) => (false, rest),
            None => (true, name),
        };

        match name {
            "force-slave" => self.force_slave = flag,
            "fork-handler" => self.fork_handler = flag,
            "debugshm" => self.debugshm = flag,
            "madv-remove" => self.madv_remove = flag,
            "secure-fusion" => self.secure_fusion = flag,
            "defer-destructors" => self.defer_destructors = flag,
            "shutdown-info" => self.shutdown_info = flag,
            "tmpfs" => {
                let dir = required(name, value)?;
                self.tmpfs = Some(PathBuf::from(dir));
            }
            "shmfile-group" => self.shmfile_group = Some(number(name, value)?),
            "trace-ref" => self.trace_ref = TraceRef::try_from(required(name, value)?.to_string())?,
            "destructor-batch" => self.destructor_batch = number(name, value)?,
            "call-bin-max-num" => self.call_bin_max_num = number(name, value)?,
            "call-bin-max-data" => self.call_bin_max_data = number(name, value)?,
            "call-timeout-ms" => self.call_timeout_ms = number(name, value)?,
            "call-retry-attempts" => self.call_retry_attempts = number(name, value)?,
            "call-retry-backoff-ms" => self.call_retry_backoff_ms = number(name, value)?,
            "reactor-queue-depth" => self.reactor_queue_depth = number(name, value)?,
            "liveness-interval-ms" => self.liveness_interval_ms = number(name, value)?,
            "join-timeout-ms" => self.join_timeout_ms = number(name, value)?,
            _ => return Err(FusionError::Config(format!("unknown option '{name}'"))),
        }
        Ok(())
    }

    /// Checks value ranges.
    ///
    /// # Errors
    ///
    /// Returns [`FusionError::Config`] naming the first bad value.
    pub fn validate(&self) -> FusionResult<()> {
        if self.destructor_batch == 0 {
            return Err(FusionError::Config("destructor-batch must be at least 1".into()));
        }
        if self.reactor_queue_depth == 0 {
            return Err(FusionError::Config("reactor-queue-depth must be at least 1".into()));
        }
        if self.liveness_interval_ms == 0 {
            return Err(FusionError::Config("liveness-interval-ms must be at least 1".into()));
        }
        if self.call_timeout_ms == 0 {
            return Err(FusionError::Config("call-timeout-ms must be at least 1".into()));
        }
        let longest = u64::try_from(MAX_WAIT.as_millis()).unwrap_or(u64::MAX);
        for (name, value) in [
            ("call-timeout-ms", self.call_timeout_ms),
            ("call-retry-backoff-ms", self.call_retry_backoff_ms),
            ("liveness-interval-ms", self.liveness_interval_ms),
            ("join-timeout-ms", self.join_timeout_ms),
        ] {
            if value > longest {
                return Err(FusionError::Config(format!("{name} must not exceed {longest}")));
            }
        }
        if self.call_bin_max_num > 0 && self.call_bin_max_data == 0 {
            return Err(FusionError::Config("call-bin-max-data must be positive when call bins are enabled".into()));
        }
        if let Some(dir) = &self.tmpfs {
            if dir.as_os_str().is_empty() {
                return Err(FusionError::Config("tmpfs: no directory name specified".into()));
            }
        }
        Ok(())
    }

    /// Directory for shared memory files, resolving the automatic default.
    #[must_use]
    pub fn shm_dir(&self) -> PathBuf {
        if let Some(dir) = &self.tmpfs {
            return dir.clone();
        }
        let dev_shm = PathBuf::from("/dev/shm");
        if dev_shm.is_dir() {
            dev_shm
        } else {
            std::env::temp_dir()
        }
    }

    /// Default call deadline.
    #[inline]
    #[must_use]
    pub const fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }

    /// Pause between call resends.
    #[inline]
    #[must_use]
    pub const fn call_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.call_retry_backoff_ms)
    }

    /// Liveness sweep period.
    #[inline]
    #[must_use]
    pub const fn liveness_interval(&self) -> Duration {
        Duration::from_millis(self.liveness_interval_ms)
    }

    /// Join deadline.
    #[inline]
    #[must_use]
    pub const fn join_timeout(&self) -> Duration {
        Duration::from_millis(self.join_timeout_ms)
    }

    /// Returns true if queued one-way calls are batched.
    #[inline]
    #[must_use]
    pub const fn call_bins_enabled(&self) -> bool {
        self.call_bin_max_num > 0
    }
}

fn required<'a>(name: &str, value: Option<&'a str>) -> FusionResult<&'a str> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(FusionError::Config(format!("'{name}': no value specified"))),
    }
}

fn number<T: std::str::FromStr>(name: &str, value: Option<&str>) -> FusionResult<T> {
    let value = required(name, value)?;
    value
        .parse()
        .map_err(|_| FusionError::Config(format!("'{name}': '{value}' is not a number")))
}
