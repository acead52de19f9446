//! Report rendering and report destinations.

use colored::*;
use prettytable::{color, Attr, Cell, Row, Table};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::error::Error;
use crate::options::{ReportEncoding, ReportOptions};
use crate::report::{LeakEntry, LeakReport};

const BYTES_PER_DUMP_LINE: usize = 16;
const SLOW_DUMP_DELAY: Duration = Duration::from_millis(10);

/// Output format for the final leak report.
///
/// # Examples
///
/// ```rust
/// use leakpath::{DetectorBuilder, Format};
///
/// let builder = DetectorBuilder::new().format(Format::JsonPretty);
/// # drop(builder);
/// ```
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Format {
    /// The classic block-by-block report.
    #[default]
    Text,
    Table,
    Json,
    JsonPretty,
}

impl FromStr for Format {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(Format::Text),
            "table" => Ok(Format::Table),
            "json" => Ok(Format::Json),
            "json-pretty" | "jsonpretty" => Ok(Format::JsonPretty),
            other => Err(format!(
                "invalid format '{other}', expected one of: text, table, json, json-pretty"
            )),
        }
    }
}

impl Format {
    pub(crate) fn reporter(self) -> Box<dyn Reporter> {
        match self {
            Format::Text => Box::new(TextReporter),
            Format::Table => Box::new(TableReporter),
            Format::Json => Box::new(JsonReporter),
            Format::JsonPretty => Box::new(JsonPrettyReporter),
        }
    }
}

/// Trait for implementing custom leak report output.
///
/// A reporter receives the final report when a [`GlobalGuard`](crate::GlobalGuard) is
/// dropped. Implement it to forward leaks to a logging system, a CI annotation or a file
/// format of your own.
///
/// # Examples
///
/// ```rust
/// use leakpath::{LeakReport, Reporter};
/// use std::error::Error;
///
/// struct FailOnLeaks;
///
/// impl Reporter for FailOnLeaks {
///     fn report(&self, report: &LeakReport) -> Result<(), Box<dyn Error>> {
///         if report.leaks > 0 {
///             return Err(format!("{} leaks", report.leaks).into());
///         }
///         Ok(())
///     }
/// }
/// ```
pub trait Reporter: Send + Sync {
    fn report(&self, report: &LeakReport) -> Result<(), Box<dyn std::error::Error>>;
}

pub(crate) struct TextReporter;

impl Reporter for TextReporter {
    fn report(&self, report: &LeakReport) -> Result<(), Box<dyn std::error::Error>> {
        let mut out = io::stdout().lock();
        for line in report_lines(report) {
            writeln!(out, "{line}")?;
        }
        Ok(())
    }
}

pub(crate) struct TableReporter;

impl Reporter for TableReporter {
    fn report(&self, report: &LeakReport) -> Result<(), Box<dyn std::error::Error>> {
        if report.is_empty() {
            println!(
                "{} {}",
                "[leakpath]".blue().bold(),
                "No memory leaks detected.".green()
            );
            return Ok(());
        }

        let use_colors = std::env::var("NO_COLOR").is_err();
        let mut table = Table::new();

        let headers = ["Block", "Address", "Size", "Count", "Total", "TID", "Hash", "Allocated at"];
        let header_cells: Vec<Cell> = headers
            .iter()
            .map(|header| {
                if use_colors {
                    Cell::new(header)
                        .with_style(Attr::Bold)
                        .with_style(Attr::ForegroundColor(color::CYAN))
                } else {
                    Cell::new(header).with_style(Attr::Bold)
                }
            })
            .collect();
        table.add_row(Row::new(header_cells));

        for entry in &report.entries {
            table.add_row(Row::new(vec![
                Cell::new(&entry.serial.to_string()),
                Cell::new(&entry.address.to_string()),
                Cell::new(&format_bytes(entry.size as u64)),
                Cell::new(&entry.count.to_string()),
                Cell::new(&format_bytes(entry.total_bytes() as u64)),
                Cell::new(&entry.thread_id.to_string()),
                Cell::new(&format!("0x{:08X}", entry.hash)),
                Cell::new(&allocation_site(entry)),
            ]));
        }

        println!(
            "{} {} memory leak{} - {} still allocated",
            "[leakpath]".blue().bold(),
            report.leaks.to_string().yellow().bold(),
            plural(report.leaks),
            format_bytes(report.stats.current as u64)
        );
        table.printstd();
        println!(
            "Largest number used: {}. Total allocations: {}.",
            format_bytes(report.stats.peak as u64),
            format_bytes(report.stats.total as u64)
        );
        Ok(())
    }
}

pub(crate) struct JsonReporter;

impl Reporter for JsonReporter {
    fn report(&self, report: &LeakReport) -> Result<(), Box<dyn std::error::Error>> {
        println!("{}", serde_json::to_string(report)?);
        Ok(())
    }
}

pub(crate) struct JsonPrettyReporter;

impl Reporter for JsonPrettyReporter {
    fn report(&self, report: &LeakReport) -> Result<(), Box<dyn std::error::Error>> {
        println!("{}", serde_json::to_string_pretty(report)?);
        Ok(())
    }
}

fn allocation_site(entry: &LeakEntry) -> String {
    let Some(frame) = entry.frames.iter().find(|f| f.is_resolved()).or(entry.frames.first())
    else {
        return "-".to_string();
    };
    match &frame.function {
        Some(function) => shorten_function_name(function),
        None => format!("0x{:X}", frame.address),
    }
}

pub fn shorten_function_name(function_name: &str) -> String {
    let parts: Vec<&str> = function_name.split("::").collect();
    if parts.len() > 2 {
        parts[parts.len() - 2..].join("::")
    } else {
        function_name.to_string()
    }
}

pub(crate) fn plural(count: usize) -> &'static str {
    if count == 1 {
        ""
    } else {
        "s"
    }
}

pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: f64 = 1024.0;

    if bytes == 0 {
        return "0 B".to_string();
    }

    let bytes_f = bytes as f64;
    let unit_index = (bytes_f.log(THRESHOLD).floor() as usize).min(UNITS.len() - 1);
    let unit_value = bytes_f / THRESHOLD.powi(unit_index as i32);

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.1} {}", unit_value, UNITS[unit_index])
    }
}

/// Text of one leak entry, as written to the report sink.
pub fn entry_lines(entry: &LeakEntry) -> Vec<String> {
    let mut lines = vec![format!(
        "---------- Block {} at {}: {} bytes ----------",
        entry.serial, entry.address, entry.size
    )];
    if let Some(request) = entry.crt_request {
        lines.push(format!("  CRT Alloc ID: {request}"));
    }
    lines.push(format!(
        "  Leak Hash: 0x{:08X}, Count: {}, Total {} bytes",
        entry.hash,
        entry.count,
        entry.total_bytes()
    ));
    if entry.count == 1 {
        lines.push(format!("  Call Stack (TID {}):", entry.thread_id));
    } else {
        lines.push("  Call Stack:".to_string());
    }
    lines.extend(entry.frames.iter().map(|frame| format!("    {frame}")));
    if let Some(data) = &entry.data {
        lines.push("  Data:".to_string());
        lines.extend(hex_dump(data));
    }
    lines.push(String::new());
    lines.push(String::new());
    lines
}

/// Full text of a report: the warning banner, every entry and the totals.
pub fn report_lines(report: &LeakReport) -> Vec<String> {
    if report.is_empty() {
        return vec!["No memory leaks detected.".to_string()];
    }
    let mut lines = vec!["WARNING: leakpath detected memory leaks!".to_string()];
    for entry in &report.entries {
        lines.extend(entry_lines(entry));
    }
    lines.extend(summary_lines(report.leaks, &report.stats));
    lines
}

pub(crate) fn summary_lines(leaks: usize, stats: &crate::registry::AllocStats) -> Vec<String> {
    if leaks == 0 {
        return vec!["No memory leaks detected.".to_string()];
    }
    vec![
        format!(
            "leakpath detected {leaks} memory leak{} ({} bytes).",
            plural(leaks),
            stats.current
        ),
        format!("Largest number used: {} bytes.", stats.peak),
        format!("Total allocations: {} bytes.", stats.total),
    ]
}

/// Hex and ASCII rendering of `data`, sixteen bytes per line.
pub fn hex_dump(data: &[u8]) -> Vec<String> {
    data.chunks(BYTES_PER_DUMP_LINE)
        .map(|chunk| {
            let mut hex = String::with_capacity(3 * BYTES_PER_DUMP_LINE + 1);
            for (i, byte) in chunk.iter().enumerate() {
                if i == BYTES_PER_DUMP_LINE / 2 {
                    hex.push(' ');
                }
                hex.push_str(&format!("{byte:02X} "));
            }
            let ascii: String = chunk
                .iter()
                .map(|&b| {
                    if b.is_ascii_graphic() || b == b' ' {
                        b as char
                    } else {
                        '.'
                    }
                })
                .collect();
            format!("    {hex:<49}   {ascii}")
        })
        .collect()
}

struct ReportFile {
    path: PathBuf,
    writer: BufWriter<File>,
    encoding: ReportEncoding,
}

impl ReportFile {
    fn create(path: &Path, encoding: ReportEncoding) -> Result<Self, Error> {
        let file = File::create(path).map_err(|source| Error::ReportFile {
            path: path.to_path_buf(),
            source,
        })?;
        let mut writer = BufWriter::new(file);
        if encoding == ReportEncoding::Unicode {
            writer.write_all(&[0xFF, 0xFE])?;
        }
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            encoding,
        })
    }

    fn write_line(&mut self, line: &str) -> io::Result<()> {
        match self.encoding {
            ReportEncoding::Ascii => {
                self.writer.write_all(line.as_bytes())?;
                self.writer.write_all(b"\n")
            }
            ReportEncoding::Unicode => {
                for unit in line.encode_utf16().chain("\n".encode_utf16()) {
                    self.writer.write_all(&unit.to_le_bytes())?;
                }
                Ok(())
            }
        }
    }
}

/// Where report text goes. Destinations are independent; any combination may be active.
///
/// The debugger destination is standard error.
pub struct ReportSink {
    debugger: bool,
    stdout: bool,
    slow: bool,
    file: Option<ReportFile>,
}

impl ReportSink {
    /// Opens every destination in `options`. Fails only when the report file cannot be
    /// created.
    pub fn open(options: &ReportOptions, slow: bool) -> Result<Self, Error> {
        let file = match &options.file {
            Some(path) => Some(ReportFile::create(path, options.encoding)?),
            None => None,
        };
        Ok(Self {
            debugger: options.debugger,
            stdout: options.stdout,
            slow,
            file,
        })
    }

    /// The sink used when the report file is unusable: the debugger plus stdout if asked.
    pub fn fallback(options: &ReportOptions, slow: bool) -> Self {
        Self {
            debugger: true,
            stdout: options.stdout,
            slow,
            file: None,
        }
    }

    /// Drops every line.
    pub fn discard() -> Self {
        Self {
            debugger: false,
            stdout: false,
            slow: false,
            file: None,
        }
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file.as_ref().map(|f| f.path.as_path())
    }

    pub fn write_line(&mut self, line: &str) {
        if self.debugger {
            let _ = writeln!(io::stderr().lock(), "{line}");
            if self.slow {
                std::thread::sleep(SLOW_DUMP_DELAY);
            }
        }
        if self.stdout {
            let _ = writeln!(io::stdout().lock(), "{line}");
        }
        if let Some(file) = &mut self.file {
            if let Err(error) = file.write_line(line) {
                tracing::warn!(path = %file.path.display(), %error, "failed to write report line");
            }
        }
    }

    pub fn write_lines<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for line in lines {
            self.write_line(line.as_ref());
        }
    }

    pub fn flush(&mut self) {
        if let Some(file) = &mut self.file {
            let _ = file.writer.flush();
        }
        let _ = io::stdout().flush();
    }
}

impl Drop for ReportSink {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callstack::ResolvedFrame;
    use crate::handle::{Address, HeapId, ThreadId};
    use crate::registry::AllocStats;

    fn entry(count: usize) -> LeakEntry {
        LeakEntry {
            serial: 3,
            heap: HeapId(1),
            address: Address(0x1000),
            size: 64,
            hash: 0xDEAD_BEEF,
            count,
            thread_id: ThreadId(42),
            frames: vec![
                ResolvedFrame {
                    address: 0x10,
                    function: Some("app::work".to_string()),
                    file: Some("src/main.rs".to_string()),
                    line: Some(12),
                    ..Default::default()
                },
                ResolvedFrame::unresolved(0x20),
            ],
            data: None,
            crt_request: None,
        }
    }

    #[test]
    fn parses_formats() {
        assert_eq!("json-pretty".parse::<Format>().unwrap(), Format::JsonPretty);
        assert_eq!("TABLE".parse::<Format>().unwrap(), Format::Table);
        assert!("yaml".parse::<Format>().is_err());
    }

    #[test]
    fn single_leak_names_its_thread() {
        let lines = entry_lines(&entry(1));
        assert!(lines[0].starts_with("---------- Block 3 at 0x"));
        assert!(lines[0].ends_with(": 64 bytes ----------"));
        assert_eq!(lines[1], "  Leak Hash: 0xDEADBEEF, Count: 1, Total 64 bytes");
        assert_eq!(lines[2], "  Call Stack (TID 42):");
        assert_eq!(lines[3], "    src/main.rs (12): app::work");
        assert!(lines[4].contains("File and line number not available"));
    }

    #[test]
    fn aggregated_leak_has_a_plain_call_stack_header() {
        let lines = entry_lines(&entry(3));
        assert_eq!(lines[1], "  Leak Hash: 0xDEADBEEF, Count: 3, Total 192 bytes");
        assert_eq!(lines[2], "  Call Stack:");
    }

    #[test]
    fn data_is_dumped_as_hex_and_ascii() {
        let mut leak = entry(1);
        leak.data = Some(b"leakpath!\x00\x01 data dump".to_vec());
        let lines = entry_lines(&leak);
        let data_at = lines.iter().position(|l| l == "  Data:").unwrap();
        assert!(lines[data_at + 1].starts_with("    6C 65 61 6B 70 61 74 68  21 00 01 20"));
        assert!(lines[data_at + 1].ends_with("leakpath!.. data"));
        assert!(lines[data_at + 2].ends_with(" dump"));
    }

    #[test]
    fn summary_reports_counters() {
        let stats = AllocStats {
            total: 192,
            current: 64,
            peak: 192,
            blocks: 1,
            heaps: 1,
        };
        let lines = summary_lines(1, &stats);
        assert_eq!(lines[0], "leakpath detected 1 memory leak (64 bytes).");
        assert_eq!(lines[1], "Largest number used: 192 bytes.");
        assert_eq!(lines[2], "Total allocations: 192 bytes.");
        assert_eq!(summary_lines(0, &stats), vec!["No memory leaks detected."]);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(2048), "2.0 KB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MB");
    }

    #[test]
    fn unicode_report_files_carry_a_bom() {
        let dir = std::env::temp_dir().join(format!("leakpath-sink-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("report.txt");
        let options = ReportOptions {
            debugger: false,
            stdout: false,
            file: Some(path.clone()),
            encoding: ReportEncoding::Unicode,
        };
        {
            let mut sink = ReportSink::open(&options, false).unwrap();
            assert_eq!(sink.file_path(), Some(path.as_path()));
            sink.write_line("ok");
        }
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(bytes, [0xFF, 0xFE, b'o', 0, b'k', 0, b'\n', 0]);
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn unopenable_report_file_is_an_error() {
        let options = ReportOptions {
            debugger: false,
            stdout: false,
            file: Some(PathBuf::from("/nonexistent-leakpath-dir/report.txt")),
            encoding: ReportEncoding::Ascii,
        };
        let err = ReportSink::open(&options, false).err().unwrap();
        assert!(matches!(err, Error::ReportFile { .. }));
        assert!(ReportSink::fallback(&options, false).file_path().is_none());
    }
}
