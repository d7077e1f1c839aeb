//! Tracing configuration and initialization.

use tracing_indicatif::IndicatifLayer;
use tracing_subscriber::{
    EnvFilter,
    fmt::format::FmtSpan,
    layer::SubscriberExt as _,
    util::{SubscriberInitExt as _, TryInitError},
};

/// Environment variable consulted before `RUST_LOG`.
const LOG_ENV: &str = "FUSE_DISPATCH_LOG";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TrcMode {
    /// Plain, verbose output with span enter/close events.
    Ugly,
    /// Compact output behind progress spinners.
    Pretty,
}

pub struct Trc {
    mode: TrcMode,
    env_filter: EnvFilter,
}

impl Default for Trc {
    fn default() -> Self {
        match EnvFilter::try_from_env(LOG_ENV).or_else(|_| EnvFilter::try_from_default_env()) {
            // Someone who sets a filter wants to read the output, not watch spinners.
            Ok(env_filter) => Self {
                mode: TrcMode::Ugly,
                env_filter,
            },
            Err(_) => Self {
                mode: TrcMode::Pretty,
                env_filter: EnvFilter::new("info"),
            },
        }
    }
}

impl Trc {
    /// `--debug`: log everything of ours at debug level in plain mode.
    pub fn with_debug(mut self, debug: bool) -> Self {
        if debug {
            self.mode = TrcMode::Ugly;
            self.env_filter = self
                .env_filter
                .add_directive(tracing::level_filters::LevelFilter::DEBUG.into());
        }
        self
    }

    /// `--debug-fuse`: also trace the transport's own request decoding.
    pub fn with_fuse_debug(mut self, debug_fuse: bool) -> Self {
        if debug_fuse {
            self.mode = TrcMode::Ugly;
            match "fuser=trace".parse() {
                Ok(directive) => self.env_filter = self.env_filter.add_directive(directive),
                Err(e) => eprintln!("Ignoring invalid fuser log directive: {e}"),
            }
        }
        self
    }

    pub fn init(self) -> Result<(), TryInitError> {
        match self.mode {
            TrcMode::Ugly => self.init_ugly_mode(),
            TrcMode::Pretty => self.init_pretty_mode(),
        }
    }

    fn init_ugly_mode(self) -> Result<(), TryInitError> {
        tracing_subscriber::fmt()
            .with_env_filter(self.env_filter)
            .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
            .with_thread_names(true)
            .finish()
            .try_init()
    }

    fn init_pretty_mode(self) -> Result<(), TryInitError> {
        let indicatif_layer = IndicatifLayer::new();
        tracing_subscriber::registry()
            .with(self.env_filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(indicatif_layer.get_stderr_writer())
                    .with_target(false)
                    .without_time()
                    .compact(),
            )
            .with(indicatif_layer)
            .try_init()
    }
}
