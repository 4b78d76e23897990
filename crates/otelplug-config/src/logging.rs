//! The `log_format` setting.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// How the host renders log lines on stderr.
///
/// Parsed case-insensitively from `OTELPLUG_LOG_FORMAT` or `--log-format`.
#[derive(
    Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, EnumString, Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum LogFormat {
    /// One JSON object per event with fields flattened to the top level.
    #[default]
    Json,
    /// Terse text for a terminal.
    Compact,
}

/// Returned when text names no [`LogFormat`].
pub type LogFormatParseError = strum::ParseError;
