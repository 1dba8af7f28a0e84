use crate::config::Config;
use crate::state::Sample;
use chrono::{DateTime, SecondsFormat, Utc};
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// One persisted line:
/// `<rfc3339> - CPU Usage: <f>% | Memory Usage: <f>% | Disk Usage: <f>%`.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    pub cpu_percent: f64,
    pub mem_percent: f64,
    pub disk_percent: f64,
}

impl From<&Sample> for LogRecord {
    fn from(sample: &Sample) -> Self {
        Self {
            timestamp: sample.wall_clock,
            cpu_percent: sample.cpu_percent,
            mem_percent: sample.mem_percent,
            disk_percent: sample.disk_percent,
        }
    }
}

impl fmt::Display for LogRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} - CPU Usage: {:.2}% | Memory Usage: {:.2}% | Disk Usage: {:.2}%",
            self.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
            self.cpu_percent,
            self.mem_percent,
            self.disk_percent
        )
    }
}

#[derive(Debug, Error)]
#[error("некорректная запись журнала ({reason}): {line:?}")]
pub struct RecordParseError {
    line: String,
    reason: &'static str,
}

impl LogRecord {
    pub fn parse(line: &str) -> Result<Self, RecordParseError> {
        let fail = |reason| RecordParseError {
            line: line.to_string(),
            reason,
        };

        let (ts, rest) = line.split_once(" - ").ok_or_else(|| fail("нет метки времени"))?;
        let timestamp = DateTime::parse_from_rfc3339(ts)
            .map_err(|_| fail("метка времени не в формате RFC 3339"))?
            .with_timezone(&Utc);

        let mut parts = rest.split(" | ");
        let cpu_percent =
            percent_field(parts.next(), "CPU Usage: ").ok_or_else(|| fail("поле CPU"))?;
        let mem_percent =
            percent_field(parts.next(), "Memory Usage: ").ok_or_else(|| fail("поле Memory"))?;
        let disk_percent =
            percent_field(parts.next(), "Disk Usage: ").ok_or_else(|| fail("поле Disk"))?;
        if parts.next().is_some() {
            return Err(fail("лишние поля"));
        }

        Ok(Self {
            timestamp,
            cpu_percent,
            mem_percent,
            disk_percent,
        })
    }
}

fn percent_field(part: Option<&str>, label: &str) -> Option<f64> {
    part?
        .strip_prefix(label)?
        .strip_suffix('%')?
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
}

#[derive(Debug, Error)]
pub enum WriteError {
    #[error("не удалось записать в сегмент {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("не удалось выполнить ротацию сегмента {path}: {source}")]
    Rotate { path: PathBuf, source: io::Error },
    #[error("запись не завершилась за {0:?}")]
    Timeout(Duration),
    #[error("предыдущая запись ещё выполняется")]
    Busy,
    #[error("журнал уже закрыт")]
    Closed,
    #[error("задача записи завершилась аварийно: {0}")]
    Aborted(String),
}

impl WriteError {
    pub fn kind(&self) -> &'static str {
        match self {
            WriteError::Io { .. } => "io",
            WriteError::Rotate { .. } => "rotate",
            WriteError::Timeout(_) => "timeout",
            WriteError::Busy => "busy",
            WriteError::Closed => "closed",
            WriteError::Aborted(_) => "aborted",
        }
    }
}

#[derive(Debug, Error)]
#[error("сегмент {path} повреждён начиная с байта {offset}, отброшено {dropped_bytes} байт")]
pub struct CorruptSegmentError {
    pub path: PathBuf,
    pub offset: u64,
    pub dropped_bytes: u64,
}

#[derive(Debug, Error)]
pub enum StartupError {
    #[error("каталог журнала {path} недоступен: {source}")]
    Directory { path: PathBuf, source: io::Error },
    #[error("не удалось открыть сегмент {path}: {source}")]
    Open { path: PathBuf, source: io::Error },
    #[error("не удалось восстановить сегмент {path}: {source}")]
    Recover { path: PathBuf, source: io::Error },
    #[error("не удалось закрыть повреждённый сегмент: {0}")]
    Seal(WriteError),
}

#[derive(Debug)]
pub struct RecoveryReport {
    pub path: PathBuf,
    pub records: usize,
    pub damaged_lines: Vec<u64>,
    pub corruption: Option<CorruptSegmentError>,
}

#[derive(Debug, Clone)]
pub struct SegmentPolicy {
    pub prefix: String,
    pub max_bytes: u64,
    pub max_age: Option<Duration>,
    pub max_segments: Option<usize>,
}

impl SegmentPolicy {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            prefix: cfg.segment_prefix.clone(),
            max_bytes: cfg.segment_max_bytes,
            max_age: cfg.segment_max_age,
            max_segments: cfg.max_segments,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogStats {
    pub segment_bytes: u64,
    pub rotations: u64,
}

pub trait SampleLog: Send {
    fn append(&mut self, sample: &Sample) -> Result<(), WriteError>;
    fn close(&mut self) -> Result<(), WriteError>;
    fn stats(&self) -> LogStats;
}

/// Owns the active segment file. Every successful `append` has been
/// written and fsynced before it returns.
pub struct SegmentWriter {
    dir: PathBuf,
    policy: SegmentPolicy,
    seq: u64,
    path: PathBuf,
    file: Option<File>,
    len: u64,
    opened_at: Instant,
    pending_truncate: Option<u64>,
    rotations: u64,
}

impl SegmentWriter {
    pub fn open(
        dir: impl Into<PathBuf>,
        policy: SegmentPolicy,
    ) -> Result<(Self, Option<RecoveryReport>), StartupError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| StartupError::Directory {
            path: dir.clone(),
            source,
        })?;
        let segments =
            list_segments(&dir, &policy.prefix).map_err(|source| StartupError::Directory {
                path: dir.clone(),
                source,
            })?;

        let (seq, path, file, report) = match segments.last() {
            Some((seq, path)) => {
                let report = recover_segment(path).map_err(|source| StartupError::Recover {
                    path: path.clone(),
                    source,
                })?;
                let file = OpenOptions::new()
                    .append(true)
                    .open(path)
                    .map_err(|source| StartupError::Open {
                        path: path.clone(),
                        source,
                    })?;
                (*seq, path.clone(), file, Some(report))
            }
            None => {
                let path = dir.join(segment_file_name(&policy.prefix, 1));
                let file = OpenOptions::new()
                    .append(true)
                    .create_new(true)
                    .open(&path)
                    .map_err(|source| StartupError::Open {
                        path: path.clone(),
                        source,
                    })?;
                if let Err(err) = sync_dir(&dir) {
                    warn!(error = %err, dir = %dir.display(), "не удалось синхронизировать каталог");
                }
                (1, path, file, None)
            }
        };

        let len = file
            .metadata()
            .map_err(|source| StartupError::Open {
                path: path.clone(),
                source,
            })?
            .len();

        let mut writer = Self {
            dir,
            policy,
            seq,
            path,
            file: Some(file),
            len,
            opened_at: Instant::now(),
            pending_truncate: None,
            rotations: 0,
        };
        if report.as_ref().is_some_and(|r| !r.damaged_lines.is_empty()) {
            writer.rotate().map_err(StartupError::Seal)?;
        } else {
            writer.enforce_retention();
        }
        Ok((writer, report))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    pub fn len_bytes(&self) -> u64 {
        self.len
    }

    pub fn append(&mut self, sample: &Sample) -> Result<(), WriteError> {
        let line = format!("{}\n", LogRecord::from(sample));
        self.append_line(line.as_bytes())
    }

    fn append_line(&mut self, bytes: &[u8]) -> Result<(), WriteError> {
        self.repair_tail()?;
        let incoming = bytes.len() as u64;
        if self.should_rotate(incoming) {
            self.rotate()?;
        }

        let before = self.len;
        let result = {
            let file = self.file.as_mut().ok_or(WriteError::Closed)?;
            file.write_all(bytes)
                .and_then(|()| file.flush())
                .and_then(|()| file.sync_data())
        };

        match result {
            Ok(()) => {
                self.len = before + incoming;
                Ok(())
            }
            Err(source) => {
                self.pending_truncate = Some(before);
                if let Err(err) = self.repair_tail() {
                    warn!(error = %err, "не удалось откатить частичную запись, повтор при следующей записи");
                }
                Err(WriteError::Io {
                    path: self.path.clone(),
                    source,
                })
            }
        }
    }

    fn repair_tail(&mut self) -> Result<(), WriteError> {
        let Some(len) = self.pending_truncate else {
            return Ok(());
        };
        let file = self.file.as_mut().ok_or(WriteError::Closed)?;
        file.set_len(len)
            .and_then(|()| file.sync_data())
            .map_err(|source| WriteError::Io {
                path: self.path.clone(),
                source,
            })?;
        self.pending_truncate = None;
        self.len = len;
        Ok(())
    }

    fn should_rotate(&self, incoming: u64) -> bool {
        if self.len == 0 {
            return false;
        }
        let too_big = self.len.saturating_add(incoming) > self.policy.max_bytes;
        let too_old = self
            .policy
            .max_age
            .is_some_and(|age| self.opened_at.elapsed() >= age);
        too_big || too_old
    }

    fn rotate(&mut self) -> Result<(), WriteError> {
        if let Some(file) = self.file.as_mut() {
            file.flush()
                .and_then(|()| file.sync_all())
                .map_err(|source| WriteError::Rotate {
                    path: self.path.clone(),
                    source,
                })?;
        }

        let next_seq = self.seq + 1;
        let next_path = self.dir.join(segment_file_name(&self.policy.prefix, next_seq));
        let file = OpenOptions::new()
            .append(true)
            .create_new(true)
            .open(&next_path)
            .map_err(|source| WriteError::Rotate {
                path: next_path.clone(),
                source,
            })?;
        if let Err(err) = sync_dir(&self.dir) {
            warn!(error = %err, dir = %self.dir.display(), "не удалось синхронизировать каталог");
        }

        let previous = std::mem::replace(&mut self.path, next_path);
        self.file = Some(file);
        self.seq = next_seq;
        self.len = 0;
        self.opened_at = Instant::now();
        self.rotations += 1;
        info!(
            from = %previous.display(),
            to = %self.path.display(),
            "ротация сегмента"
        );

        self.enforce_retention();
        Ok(())
    }

    fn enforce_retention(&self) {
        let Some(keep) = self.policy.max_segments else {
            return;
        };
        let segments = match list_segments(&self.dir, &self.policy.prefix) {
            Ok(segments) => segments,
            Err(err) => {
                warn!(error = %err, dir = %self.dir.display(), "не удалось получить список сегментов");
                return;
            }
        };
        if segments.len() <= keep {
            return;
        }
        for (seq, path) in &segments[..segments.len() - keep] {
            if *seq == self.seq {
                continue;
            }
            match fs::remove_file(path) {
                Ok(()) => info!(segment = %path.display(), "удалён устаревший сегмент"),
                Err(err) => {
                    warn!(error = %err, segment = %path.display(), "не удалось удалить сегмент")
                }
            }
        }
    }

    pub fn close(&mut self) -> Result<(), WriteError> {
        let Some(file) = self.file.take() else {
            return Ok(());
        };
        file.sync_all().map_err(|source| WriteError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl SampleLog for SegmentWriter {
    fn append(&mut self, sample: &Sample) -> Result<(), WriteError> {
        SegmentWriter::append(self, sample)
    }

    fn close(&mut self) -> Result<(), WriteError> {
        SegmentWriter::close(self)
    }

    fn stats(&self) -> LogStats {
        LogStats {
            segment_bytes: self.len,
            rotations: self.rotations,
        }
    }
}

impl Drop for SegmentWriter {
    fn drop(&mut self) {
        if let Some(file) = self.file.as_ref() {
            if let Err(err) = file.sync_all() {
                warn!(error = %err, segment = %self.path.display(), "не удалось синхронизировать сегмент при закрытии");
            }
        }
    }
}

pub fn segment_file_name(prefix: &str, seq: u64) -> String {
    format!("{prefix}.{seq:06}.log")
}

fn parse_segment_seq(name: &str, prefix: &str) -> Option<u64> {
    let digits = name
        .strip_prefix(prefix)?
        .strip_prefix('.')?
        .strip_suffix(".log")?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

pub fn list_segments(dir: &Path, prefix: &str) -> io::Result<Vec<(u64, PathBuf)>> {
    let mut out = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if let Some(seq) = name.to_str().and_then(|n| parse_segment_seq(n, prefix)) {
            out.push((seq, entry.path()));
        }
    }
    out.sort_by_key(|(seq, _)| *seq);
    Ok(out)
}

/// Truncates `path` after its last complete, parseable record. Damaged lines
/// followed by valid records stay in place.
pub fn recover_segment(path: &Path) -> io::Result<RecoveryReport> {
    let bytes = fs::read(path)?;
    let scan = scan_segment(&bytes);
    let dropped_bytes = bytes.len() as u64 - scan.valid_len;

    if !scan.damaged_lines.is_empty() {
        warn!(
            segment = %path.display(),
            damaged = scan.damaged_lines.len(),
            first_offset = scan.damaged_lines[0],
            "в середине сегмента есть повреждённые строки, сегмент будет закрыт"
        );
    }

    let corruption = if dropped_bytes > 0 {
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(scan.valid_len)?;
        file.sync_all()?;
        let err = CorruptSegmentError {
            path: path.to_path_buf(),
            offset: scan.valid_len,
            dropped_bytes,
        };
        warn!(error = %err, records = scan.records, "хвост сегмента усечён при восстановлении");
        Some(err)
    } else {
        None
    };

    Ok(RecoveryReport {
        path: path.to_path_buf(),
        records: scan.records,
        damaged_lines: scan.damaged_lines,
        corruption,
    })
}

struct SegmentScan {
    valid_len: u64,
    records: usize,
    damaged_lines: Vec<u64>,
}

fn scan_segment(bytes: &[u8]) -> SegmentScan {
    let mut scan = SegmentScan {
        valid_len: 0,
        records: 0,
        damaged_lines: Vec::new(),
    };
    let mut unconfirmed = Vec::new();
    let mut pos = 0;
    while let Some(nl) = bytes[pos..].iter().position(|b| *b == b'\n') {
        let end = pos + nl + 1;
        let valid = std::str::from_utf8(&bytes[pos..pos + nl])
            .ok()
            .is_some_and(|l| LogRecord::parse(l).is_ok());
        if valid {
            scan.records += 1;
            scan.damaged_lines.append(&mut unconfirmed);
            scan.valid_len = end as u64;
        } else {
            unconfirmed.push(pos as u64);
        }
        pos = end;
    }
    scan
}

#[cfg(unix)]
fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::sample_at;
    use tempfile::tempdir;

    fn policy(max_bytes: u64) -> SegmentPolicy {
        SegmentPolicy {
            prefix: "system_monitor".to_string(),
            max_bytes,
            max_age: None,
            max_segments: None,
        }
    }

    fn read_segment(path: &Path) -> Result<Vec<LogRecord>, RecordParseError> {
        fs::read_to_string(path)
            .expect("чтение сегмента")
            .lines()
            .map(LogRecord::parse)
            .collect()
    }

    fn read_all(dir: &Path) -> Vec<LogRecord> {
        list_segments(dir, "system_monitor")
            .expect("список сегментов")
            .iter()
            .flat_map(|(_, path)| read_segment(path).expect("чтение сегмента"))
            .collect()
    }

    fn assert_close(a: f64, b: f64) {
        assert!((a - b).abs() < 0.006, "{a} != {b}");
    }

    #[test]
    fn record_line_matches_log_format() {
        let record = LogRecord::from(&sample_at(0, 12.5, 40.0, 71.25));
        assert_eq!(
            record.to_string(),
            "2023-11-14T22:13:20.000Z - CPU Usage: 12.50% | Memory Usage: 40.00% | Disk Usage: 71.25%"
        );
    }

    #[test]
    fn record_round_trips_within_tolerance() {
        let sample = sample_at(5, 33.333_333, 66.666_666, 99.999);
        let parsed = LogRecord::parse(&LogRecord::from(&sample).to_string())
            .expect("запись должна разбираться");
        assert_eq!(parsed.timestamp, sample.wall_clock);
        assert_close(parsed.cpu_percent, sample.cpu_percent);
        assert_close(parsed.mem_percent, sample.mem_percent);
        assert_close(parsed.disk_percent, sample.disk_percent);
    }

    #[test]
    fn parse_rejects_partial_lines() {
        for line in [
            "",
            "2023-11-14T22:13:2",
            "2023-11-14T22:13:20.000Z - CPU Usage: 12.50% | Memory Us",
            "2023-11-14T22:13:20.000Z - CPU Usage: 12.50% | Memory Usage: 4% | Disk Usage: 7",
            "yesterday - CPU Usage: 1% | Memory Usage: 1% | Disk Usage: 1%",
        ] {
            assert!(LogRecord::parse(line).is_err(), "строка {line:?} должна отвергаться");
        }
    }

    #[test]
    fn appends_preserve_order_without_duplicates() {
        let dir = tempdir().expect("временный каталог");
        let (mut writer, report) =
            SegmentWriter::open(dir.path(), policy(1 << 20)).expect("открытие журнала");
        assert!(report.is_none());

        for t in 0..10 {
            writer
                .append(&sample_at(t, t as f64, 0.0, 0.0))
                .expect("запись");
        }
        writer.close().expect("закрытие");

        let cpus: Vec<f64> = read_all(dir.path()).iter().map(|r| r.cpu_percent).collect();
        assert_eq!(cpus, (0..10).map(|t| t as f64).collect::<Vec<_>>());
    }

    #[test]
    fn rotates_by_size_without_losing_records() {
        let dir = tempdir().expect("временный каталог");
        let (mut writer, _) = SegmentWriter::open(dir.path(), policy(256)).expect("открытие журнала");

        for t in 0..5 {
            writer
                .append(&sample_at(t, 10.0 + t as f64, 20.0, 30.0))
                .expect("запись");
        }
        assert_eq!(writer.seq(), 3);
        assert_eq!(writer.stats().rotations, 2);
        writer.close().expect("закрытие");

        let segments = list_segments(dir.path(), "system_monitor").expect("список сегментов");
        assert_eq!(segments.len(), 3);
        for (_, path) in &segments {
            let len = fs::metadata(path).expect("метаданные").len();
            assert!(len <= 256, "сегмент {} превышает лимит", path.display());
        }
        let cpus: Vec<f64> = read_all(dir.path()).iter().map(|r| r.cpu_percent).collect();
        assert_eq!(cpus, vec![10.0, 11.0, 12.0, 13.0, 14.0]);
    }

    #[test]
    fn rotates_by_age_and_enforces_retention() {
        let dir = tempdir().expect("временный каталог");
        let policy = SegmentPolicy {
            max_age: Some(Duration::from_millis(1)),
            max_segments: Some(2),
            ..policy(1 << 20)
        };
        let (mut writer, _) = SegmentWriter::open(dir.path(), policy).expect("открытие журнала");

        for t in 0..4 {
            writer.append(&sample_at(t, 1.0, 1.0, 1.0)).expect("запись");
            std::thread::sleep(Duration::from_millis(5));
        }

        let segments = list_segments(dir.path(), "system_monitor").expect("список сегментов");
        let seqs: Vec<u64> = segments.iter().map(|(seq, _)| *seq).collect();
        assert_eq!(seqs, vec![3, 4]);
        assert_eq!(writer.path(), segments[1].1.as_path());
    }

    #[test]
    fn reopen_continues_newest_segment() {
        let dir = tempdir().expect("временный каталог");
        {
            let (mut writer, _) =
                SegmentWriter::open(dir.path(), policy(256)).expect("открытие журнала");
            for t in 0..3 {
                writer.append(&sample_at(t, 1.0, 1.0, 1.0)).expect("запись");
            }
        }

        let (mut writer, report) =
            SegmentWriter::open(dir.path(), policy(256)).expect("повторное открытие");
        let report = report.expect("последний сегмент проверяется");
        assert_eq!(report.records, 1);
        assert!(report.corruption.is_none());
        assert_eq!(writer.seq(), 2);

        writer.append(&sample_at(3, 1.0, 1.0, 1.0)).expect("запись");
        assert_eq!(read_all(dir.path()).len(), 4);
    }

    #[test]
    fn recovery_truncates_torn_tail_and_appends_continue() {
        let dir = tempdir().expect("временный каталог");
        let path = {
            let (mut writer, _) =
                SegmentWriter::open(dir.path(), policy(1 << 20)).expect("открытие журнала");
            for t in 0..3 {
                writer.append(&sample_at(t, 50.0, 50.0, 50.0)).expect("запись");
            }
            writer.path().to_path_buf()
        };
        let clean_len = fs::metadata(&path).expect("метаданные").len();

        let torn = b"2023-11-14T22:13:23.000Z - CPU Usage: 5";
        let mut file = OpenOptions::new().append(true).open(&path).expect("открытие");
        file.write_all(torn).expect("частичная запись");
        drop(file);

        let (mut writer, report) =
            SegmentWriter::open(dir.path(), policy(1 << 20)).expect("восстановление");
        let report = report.expect("отчёт о восстановлении");
        let corruption = report.corruption.expect("хвост должен быть обнаружен");
        assert_eq!(corruption.offset, clean_len);
        assert_eq!(corruption.dropped_bytes, torn.len() as u64);
        assert_eq!(report.records, 3);

        writer.append(&sample_at(3, 60.0, 60.0, 60.0)).expect("запись после восстановления");
        writer.close().expect("закрытие");

        let records = read_segment(&path).expect("сегмент читается целиком");
        assert_eq!(records.len(), 4);
        assert_eq!(records[3].cpu_percent, 60.0);
    }

    #[test]
    fn recovery_keeps_records_after_damaged_line_and_seals_segment() {
        let dir = tempdir().expect("временный каталог");
        let path = dir.path().join(segment_file_name("system_monitor", 1));
        let line = |t: u64| format!("{}\n", LogRecord::from(&sample_at(t, t as f64, 1.0, 1.0)));
        let torn = "2023-11-14T22:13:2";
        let mut text = line(0);
        text.push('\n');
        for t in 1..4 {
            text.push_str(&line(t));
        }
        text.push_str(torn);
        fs::write(&path, &text).expect("подготовка сегмента");

        let (mut writer, report) =
            SegmentWriter::open(dir.path(), policy(1 << 20)).expect("восстановление");
        let report = report.expect("отчёт о восстановлении");
        assert_eq!(report.records, 4);
        assert_eq!(report.damaged_lines, vec![line(0).len() as u64]);
        let corruption = report.corruption.expect("оборванный хвост");
        assert_eq!(corruption.dropped_bytes, torn.len() as u64);

        assert_eq!(writer.seq(), 2);
        writer.append(&sample_at(4, 4.0, 1.0, 1.0)).expect("запись в новый сегмент");
        writer.close().expect("закрытие");

        let kept: Vec<f64> = fs::read_to_string(&path)
            .expect("чтение")
            .lines()
            .filter_map(|l| LogRecord::parse(l).ok())
            .map(|r| r.cpu_percent)
            .collect();
        assert_eq!(kept, vec![0.0, 1.0, 2.0, 3.0]);
        let next = read_segment(writer.path()).expect("новый сегмент чистый");
        assert_eq!(next.len(), 1);
    }

    #[test]
    fn failed_append_is_rolled_back_before_next_write() {
        let dir = tempdir().expect("временный каталог");
        let (mut writer, _) =
            SegmentWriter::open(dir.path(), policy(1 << 20)).expect("открытие журнала");
        for t in 0..3 {
            writer.append(&sample_at(t, 1.0, 1.0, 1.0)).expect("запись");
        }
        let path = writer.path().to_path_buf();
        let clean_len = writer.len_bytes();

        let mut raw = OpenOptions::new().append(true).open(&path).expect("открытие");
        raw.write_all(b"2023-11-14T22:13:23.000Z - CPU Us")
            .expect("частичная запись");
        drop(raw);

        let appender = writer
            .file
            .replace(File::open(&path).expect("дескриптор только для чтения"));
        let err = writer
            .append(&sample_at(3, 2.0, 2.0, 2.0))
            .expect_err("запись через дескриптор только для чтения");
        assert!(matches!(err, WriteError::Io { .. }));
        assert_eq!(writer.pending_truncate, Some(clean_len));

        writer.file = appender;
        writer
            .append(&sample_at(4, 3.0, 3.0, 3.0))
            .expect("запись после отката");
        writer.close().expect("закрытие");

        let records = read_segment(&path).expect("в сегменте нет оборванных строк");
        assert_eq!(records.len(), 4);
        assert_eq!(records[3].cpu_percent, 3.0);
        assert_eq!(
            writer.len_bytes(),
            fs::metadata(&path).expect("метаданные").len()
        );
    }

    #[test]
    fn recovery_is_idempotent_on_clean_segment() {
        let dir = tempdir().expect("временный каталог");
        let path = {
            let (mut writer, _) =
                SegmentWriter::open(dir.path(), policy(1 << 20)).expect("открытие журнала");
            writer.append(&sample_at(0, 1.0, 2.0, 3.0)).expect("запись");
            writer.path().to_path_buf()
        };
        let before = fs::read(&path).expect("чтение");

        for _ in 0..2 {
            let report = recover_segment(&path).expect("восстановление");
            assert!(report.corruption.is_none());
            assert_eq!(report.records, 1);
        }
        assert_eq!(fs::read(&path).expect("чтение"), before);
    }

    #[test]
    fn unusable_directory_fails_at_startup() {
        let dir = tempdir().expect("временный каталог");
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, b"x").expect("файл-заглушка");

        let result = SegmentWriter::open(blocker.join("logs"), policy(1 << 20));
        assert!(matches!(result, Err(StartupError::Directory { .. })));
    }

    #[test]
    fn segment_names_are_recognised() {
        assert_eq!(segment_file_name("system_monitor", 7), "system_monitor.000007.log");
        assert_eq!(parse_segment_seq("system_monitor.000007.log", "system_monitor"), Some(7));
        assert_eq!(parse_segment_seq("system_monitor.log", "system_monitor"), None);
        assert_eq!(parse_segment_seq("system_monitor.00a1.log", "system_monitor"), None);
        assert_eq!(parse_segment_seq("other.000001.log", "system_monitor"), None);
    }
}
