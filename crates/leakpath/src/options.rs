use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::modules::{ModuleList, ModuleListMode};
use crate::output::Format;

pub const DEFAULT_MAX_TRACE_FRAMES: u32 = 64;
pub const DEFAULT_REPORT_FILE: &str = "leakpath_report.txt";

/// Runtime knobs of a [`LeakDetector`](crate::LeakDetector).
///
/// Options are read at the start of every tracked operation, so changes made with
/// [`LeakDetector::set_options`](crate::LeakDetector::set_options) apply to the next
/// allocation or report, never retroactively.
///
/// # Examples
///
/// ```rust
/// use leakpath::Options;
///
/// let options = Options {
///     aggregate_duplicates: true,
///     max_data_dump: Some(64),
///     ..Options::default()
/// };
/// assert!(options.skip_crt_startup_leaks);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Options {
    /// Turns the detector into a no-op for the lifetime of the instance.
    pub off: bool,
    /// Fold leaks with equal size and call stack into one entry with a repeat count.
    pub aggregate_duplicates: bool,
    /// Plant a known internal leak at attach and verify it is found at detach.
    pub self_test: bool,
    /// Throttle lines written to the debugger sink.
    pub slow_debugger_dump: bool,
    /// Threads start with detection disabled until enabled explicitly.
    pub start_disabled: bool,
    /// Start stack walks at the innermost allocation entry point and keep detector and
    /// allocator frames in reports.
    pub trace_internal_frames: bool,
    /// Consulted by heap-free hooks; the core only stores it.
    pub skip_heap_free_leaks: bool,
    /// Drop leaks allocated by runtime startup code.
    pub skip_crt_startup_leaks: bool,
    /// Look for frees of untracked addresses in every other heap.
    pub validate_heap_frees: bool,
    /// Bytes of user data dumped per leak. `None` dumps whole blocks, `Some(0)` disables.
    pub max_data_dump: Option<usize>,
    /// Upper bound of frames per captured call stack. Values below 1 mean the default.
    pub max_trace_frames: u32,
    pub modules: ModuleList,
    pub report: ReportOptions,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            off: false,
            aggregate_duplicates: false,
            self_test: false,
            slow_debugger_dump: false,
            start_disabled: false,
            trace_internal_frames: false,
            skip_heap_free_leaks: false,
            skip_crt_startup_leaks: true,
            validate_heap_frees: false,
            max_data_dump: None,
            max_trace_frames: DEFAULT_MAX_TRACE_FRAMES,
            modules: ModuleList::default(),
            report: ReportOptions::default(),
        }
    }
}

impl Options {
    /// Reads `LEAKPATH_*` environment variables on top of the defaults.
    pub fn from_env() -> Self {
        let mut options = Options::default();

        if let Ok(v) = std::env::var("LEAKPATH") {
            options.off = v.eq_ignore_ascii_case("off") || parse_bool(&v) == Some(false);
        }

        let flags: [(&str, &mut bool); 8] = [
            ("LEAKPATH_AGGREGATE_DUPLICATES", &mut options.aggregate_duplicates),
            ("LEAKPATH_SELF_TEST", &mut options.self_test),
            ("LEAKPATH_SLOW_DEBUGGER_DUMP", &mut options.slow_debugger_dump),
            ("LEAKPATH_START_DISABLED", &mut options.start_disabled),
            ("LEAKPATH_TRACE_INTERNAL_FRAMES", &mut options.trace_internal_frames),
            ("LEAKPATH_SKIP_HEAP_FREE_LEAKS", &mut options.skip_heap_free_leaks),
            ("LEAKPATH_SKIP_CRT_STARTUP_LEAKS", &mut options.skip_crt_startup_leaks),
            ("LEAKPATH_VALIDATE_HEAP_FREES", &mut options.validate_heap_frees),
        ];
        for (name, flag) in flags {
            if let Some(value) = std::env::var(name).ok().and_then(|v| parse_bool(&v)) {
                *flag = value;
            }
        }

        if let Some(max) = env_parse::<usize>("LEAKPATH_MAX_DATA_DUMP") {
            options.max_data_dump = Some(max);
        }
        if let Some(max) = env_parse::<u32>("LEAKPATH_MAX_TRACE_FRAMES") {
            options.max_trace_frames = max;
        }
        if let Ok(list) = std::env::var("LEAKPATH_FORCE_INCLUDE_MODULES") {
            options.modules = ModuleList::parse(&list, ModuleListMode::Include);
        } else if let Ok(list) = std::env::var("LEAKPATH_FORCE_EXCLUDE_MODULES") {
            options.modules = ModuleList::parse(&list, ModuleListMode::Exclude);
        }

        let file = std::env::var("LEAKPATH_REPORT_FILE").ok().map(PathBuf::from);
        let report_to = env_parse::<ReportTo>("LEAKPATH_REPORT_TO").unwrap_or_default();
        let encoding = env_parse::<ReportEncoding>("LEAKPATH_REPORT_ENCODING").unwrap_or_default();
        let wants_file = matches!(report_to, ReportTo::File | ReportTo::Both)
            || encoding == ReportEncoding::Unicode;
        options.report = ReportOptions {
            debugger: matches!(report_to, ReportTo::Debugger | ReportTo::Both),
            stdout: report_to == ReportTo::Stdout,
            file: wants_file.then(|| file.unwrap_or_else(|| PathBuf::from(DEFAULT_REPORT_FILE))),
            encoding,
        };

        options.normalized()
    }

    /// Applies the fallbacks `set_options` uses.
    pub fn normalized(mut self) -> Self {
        if self.max_trace_frames < 1 {
            self.max_trace_frames = DEFAULT_MAX_TRACE_FRAMES;
        }
        self
    }

    /// Data dump length for a block of `size` bytes.
    pub fn data_dump_len(&self, size: usize) -> usize {
        self.max_data_dump.map_or(size, |max| max.min(size))
    }
}

/// Output format requested through `LEAKPATH_FORMAT`.
pub fn format_from_env() -> Option<Format> {
    env_parse::<Format>("LEAKPATH_FORMAT")
}

/// Where report text goes. Destinations are independent of each other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportOptions {
    /// The debugger output stream; stderr on platforms without one.
    pub debugger: bool,
    pub stdout: bool,
    pub file: Option<PathBuf>,
    pub encoding: ReportEncoding,
}

impl Default for ReportOptions {
    fn default() -> Self {
        Self {
            debugger: true,
            stdout: false,
            file: None,
            encoding: ReportEncoding::Ascii,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportTo {
    #[default]
    Debugger,
    File,
    Stdout,
    /// Debugger and file.
    Both,
}

impl FromStr for ReportTo {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "debugger" => Ok(ReportTo::Debugger),
            "file" => Ok(ReportTo::File),
            "stdout" => Ok(ReportTo::Stdout),
            "both" => Ok(ReportTo::Both),
            other => Err(format!("unknown report destination {other:?}")),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportEncoding {
    #[default]
    Ascii,
    /// UTF-16LE with a byte-order mark. Only files can carry it.
    Unicode,
}

impl FromStr for ReportEncoding {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ascii" => Ok(ReportEncoding::Ascii),
            "unicode" => Ok(ReportEncoding::Unicode),
            other => Err(format!("unknown report encoding {other:?}")),
        }
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    if value.eq_ignore_ascii_case("true") || value == "1" || value.eq_ignore_ascii_case("yes") {
        Some(true)
    } else if value.eq_ignore_ascii_case("false") || value == "0" || value.eq_ignore_ascii_case("no")
    {
        Some(false)
    } else {
        None
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse::<T>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let options = Options::default();
        assert!(options.skip_crt_startup_leaks);
        assert!(!options.aggregate_duplicates);
        assert_eq!(options.max_data_dump, None);
        assert_eq!(options.max_trace_frames, DEFAULT_MAX_TRACE_FRAMES);
        assert!(options.report.debugger);
        assert!(options.report.file.is_none());
    }

    #[test]
    fn zero_trace_frames_falls_back_to_default() {
        let options = Options {
            max_trace_frames: 0,
            ..Options::default()
        }
        .normalized();
        assert_eq!(options.max_trace_frames, DEFAULT_MAX_TRACE_FRAMES);
    }

    #[test]
    fn data_dump_len_respects_limit() {
        let mut options = Options::default();
        assert_eq!(options.data_dump_len(100), 100);
        options.max_data_dump = Some(16);
        assert_eq!(options.data_dump_len(100), 16);
        assert_eq!(options.data_dump_len(4), 4);
        options.max_data_dump = Some(0);
        assert_eq!(options.data_dump_len(100), 0);
    }

    #[test]
    fn bool_parsing() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("no"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn report_to_parsing() {
        assert_eq!("Both".parse::<ReportTo>(), Ok(ReportTo::Both));
        assert_eq!("stdout".parse::<ReportTo>(), Ok(ReportTo::Stdout));
        assert!("printer".parse::<ReportTo>().is_err());
        assert_eq!("unicode".parse::<ReportEncoding>(), Ok(ReportEncoding::Unicode));
    }

    #[test]
    fn options_roundtrip_through_json() {
        let options = Options {
            aggregate_duplicates: true,
            modules: ModuleList::new(["libfoo.so"], ModuleListMode::Include),
            ..Options::default()
        };
        let json = serde_json::to_string(&options).unwrap();
        let parsed: Options = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, options);

        let partial: Options = serde_json::from_str(r#"{"self_test": true}"#).unwrap();
        assert!(partial.self_test);
        assert!(partial.skip_crt_startup_leaks);
    }
}
