#![forbid(unsafe_code)]

//! Media download through the `yt-dlp` executable.
//!
//! yt-dlp is asked to print machine-readable markers (`[title]`, `[progress]`)
//! next to its regular output; every line it writes is turned into a
//! [`DownloadEvent`] for the caller's [`DownloadObserver`].

use anyhow::{Context, Result, bail};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::thread;
use tracing::{debug, error, info, warn};

pub const YT_DLP: &str = "yt-dlp";
pub const FFMPEG: &str = "ffmpeg";

/// Pre-merged mp4/m4a pair when available, otherwise the best single file.
pub const FORMAT_SELECTOR: &str = "bestvideo[ext=mp4]+bestaudio[ext=m4a]/best[ext=mp4]/best";
pub const OUTPUT_TEMPLATE: &str = "%(title)s.%(ext)s";
/// Container every download ends up in.
pub const MEDIA_EXTENSION: &str = "mp4";

const TITLE_MARKER: &str = "[title]";
const PROGRESS_MARKER: &str = "[progress]";

#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Info(String),
    Warning(String),
    Error(String),
    Progress { percent: f32 },
}

/// Receives everything a downloader has to say about a single download.
pub trait DownloadObserver {
    /// Called once before each download starts.
    fn on_start(&mut self, _video_url: &str) {}

    fn on_event(&mut self, event: DownloadEvent);
}

/// Forwards download events to the `tracing` subscriber.
#[derive(Debug, Default)]
pub struct TracingObserver {
    last_reported_step: Option<u8>,
}

impl TracingObserver {
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `percent` enters a 25% step not yet logged for the current
    /// download.
    fn enters_new_step(&mut self, percent: f32) -> bool {
        let step = (percent.clamp(0.0, 100.0) / 25.0) as u8;
        if self.last_reported_step == Some(step) {
            return false;
        }
        self.last_reported_step = Some(step);
        true
    }
}

impl DownloadObserver for TracingObserver {
    fn on_start(&mut self, video_url: &str) {
        self.last_reported_step = None;
        debug!("Starting download of {video_url}");
    }

    fn on_event(&mut self, event: DownloadEvent) {
        match event {
            DownloadEvent::Info(message) => debug!("{message}"),
            DownloadEvent::Warning(message) => warn!("{message}"),
            DownloadEvent::Error(message) => error!("{message}"),
            DownloadEvent::Progress { percent } => {
                if self.enters_new_step(percent) {
                    info!("  {percent:.1}% downloaded");
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DownloadOutcome {
    /// Carries the title as yt-dlp resolved it, which can differ from the
    /// title seen in the channel listing.
    Completed { title: String },
    Failed,
}

pub trait MediaDownloader {
    /// Downloads one video into `output_dir`. Failures are reported through
    /// the observer and end up as [`DownloadOutcome::Failed`].
    fn download(
        &self,
        video_url: &str,
        output_dir: &Path,
        observer: &mut dyn DownloadObserver,
    ) -> DownloadOutcome;
}

/// Adapter for the [yt-dlp](https://github.com/yt-dlp/yt-dlp) program.
#[derive(Debug, Clone)]
pub struct YtDlp {
    program: PathBuf,
}

impl YtDlp {
    /// Verifies that `yt-dlp` is reachable. A missing `ffmpeg` only warns
    /// because it breaks the merge/recode step, not the run.
    pub fn new() -> Result<Self> {
        ensure_program_available(Path::new(YT_DLP), "--version")?;
        if let Err(err) = ensure_program_available(Path::new(FFMPEG), "-version") {
            warn!("{err}; merging and recoding downloads will fail");
        }
        Ok(Self::with_program(YT_DLP))
    }

    /// Uses the given executable without probing it.
    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn command(&self, video_url: &str, output_dir: &Path) -> Command {
        let output = output_dir.join(OUTPUT_TEMPLATE);
        let mut command = Command::new(&self.program);
        command
            .arg("--format")
            .arg(FORMAT_SELECTOR)
            .arg("--output")
            .arg(output)
            .arg("--merge-output-format")
            .arg(MEDIA_EXTENSION)
            .arg("--recode-video")
            .arg(MEDIA_EXTENSION)
            .arg("--no-playlist")
            .arg("--no-simulate")
            .arg("--newline")
            .arg("--progress")
            .arg("--progress-template")
            .arg(format!("download:{PROGRESS_MARKER}%(progress._percent_str)s"))
            .arg("--print")
            .arg(format!("after_move:{TITLE_MARKER}%(title)s"))
            .arg("--")
            .arg(video_url);
        command
    }

    fn run(
        &self,
        video_url: &str,
        output_dir: &Path,
        observer: &mut dyn DownloadObserver,
    ) -> Result<String> {
        let mut command = self.command(video_url, output_dir);
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        debug!("Executing command: {command:?}");

        let mut child = command
            .spawn()
            .with_context(|| format!("running {}", self.program.display()))?;

        // Both pipes are drained concurrently so neither can fill up and
        // stall the child; lines are handled here in arrival order.
        let (sender, receiver) = mpsc::channel();
        let mut readers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            readers.push(forward_lines(stdout, sender.clone()));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(forward_lines(stderr, sender.clone()));
        }
        drop(sender);

        let mut title = None;
        for line in receiver {
            match classify_line(&line) {
                OutputLine::Title(reported) => title = Some(reported.to_string()),
                OutputLine::Event(event) => observer.on_event(event),
                OutputLine::Blank => {}
            }
        }
        for reader in readers {
            let _ = reader.join();
        }

        let status = child
            .wait()
            .with_context(|| format!("waiting for {}", self.program.display()))?;
        if !status.success() {
            bail!("{} exited with {status} for {video_url}", self.program.display());
        }

        match title {
            Some(title) => Ok(title),
            None => bail!("{} did not report a title for {video_url}", self.program.display()),
        }
    }
}

impl MediaDownloader for YtDlp {
    fn download(
        &self,
        video_url: &str,
        output_dir: &Path,
        observer: &mut dyn DownloadObserver,
    ) -> DownloadOutcome {
        observer.on_start(video_url);
        match self.run(video_url, output_dir, observer) {
            Ok(title) => DownloadOutcome::Completed { title },
            Err(err) => {
                observer.on_event(DownloadEvent::Error(format!(
                    "Error downloading video: {err:#}"
                )));
                DownloadOutcome::Failed
            }
        }
    }
}

fn forward_lines<R>(source: R, sender: mpsc::Sender<String>) -> thread::JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let mut reader = BufReader::new(source);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    // Metadata can carry bytes that are not UTF-8.
                    let line = String::from_utf8_lossy(&buf).into_owned();
                    if sender.send(line).is_err() {
                        break;
                    }
                }
            }
        }
    })
}

#[derive(Debug, PartialEq)]
enum OutputLine<'a> {
    Title(&'a str),
    Event(DownloadEvent),
    Blank,
}

fn classify_line(line: &str) -> OutputLine<'_> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return OutputLine::Blank;
    }
    if let Some(title) = line.strip_prefix(TITLE_MARKER) {
        return OutputLine::Title(title);
    }
    if let Some(raw) = line.strip_prefix(PROGRESS_MARKER) {
        return match parse_percent(raw) {
            Some(percent) => OutputLine::Event(DownloadEvent::Progress { percent }),
            None => OutputLine::Blank,
        };
    }

    let message = line.trim().to_string();
    let event = if message.starts_with("ERROR:") {
        DownloadEvent::Error(message)
    } else if message.starts_with("WARNING:") {
        DownloadEvent::Warning(message)
    } else {
        DownloadEvent::Info(message)
    };
    OutputLine::Event(event)
}

/// Parses yt-dlp's `_percent_str` (e.g. `" 42.5%"`).
fn parse_percent(raw: &str) -> Option<f32> {
    raw.trim()
        .trim_end_matches('%')
        .trim()
        .parse::<f32>()
        .ok()
        .filter(|value| value.is_finite())
}

/// Runs `<program> <version_flag>` to fail loudly when a dependency is
/// missing.
fn ensure_program_available(program: &Path, version_flag: &str) -> Result<()> {
    let status = Command::new(program)
        .arg(version_flag)
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status();

    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(_) => bail!(
            "{} is installed but returned a failure status",
            program.display()
        ),
        Err(err) => bail!(
            "{} is not installed or not in PATH: {}",
            program.display(),
            err
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    #[cfg(unix)]
    use std::os::unix::fs::PermissionsExt;
    use std::fs;
    use tempfile::tempdir;

    #[derive(Default)]
    struct RecordingObserver {
        events: Vec<DownloadEvent>,
    }

    impl DownloadObserver for RecordingObserver {
        fn on_event(&mut self, event: DownloadEvent) {
            self.events.push(event);
        }
    }

    impl RecordingObserver {
        fn errors(&self) -> Vec<&str> {
            self.events
                .iter()
                .filter_map(|event| match event {
                    DownloadEvent::Error(message) => Some(message.as_str()),
                    _ => None,
                })
                .collect()
        }
    }

    /// Fake yt-dlp: `fail` in the URL exits non-zero, `notitle` succeeds
    /// without printing the title marker, `badbytes` prints a non-UTF-8 line
    /// first, anything else writes `<title>.mp4`.
    fn install_ytdlp_stub(dir: &Path) -> Result<PathBuf> {
        let script_path = dir.join("yt-dlp");
        let script = r#"#!/usr/bin/env bash
set -eu
printf '%s\n' "$@" > "$(dirname "$0")/last-args.txt"
output=""
url=""
while [[ $# -gt 0 ]]; do
  case "$1" in
    --output)
      shift
      output="$1"
      ;;
    --)
      shift
      url="$1"
      ;;
  esac
  shift || true
done

case "$url" in
  *fail*)
    echo "ERROR: [youtube] ${url##*=}: Video unavailable" >&2
    exit 1
    ;;
esac

title="Stub: Title"
case "$url" in
  *v=v1) title="A" ;;
  *badbytes*) printf '[info] \xff\n' ;;
esac

echo "[progress]  10.0%"
echo "WARNING: stub warning" >&2
echo "[progress] 100.0%"
target="${output//%(title)s/$title}"
target="${target//%(ext)s/mp4}"
mkdir -p "$(dirname "$target")"
echo "video" > "$target"

case "$url" in
  *notitle*) exit 0 ;;
esac
echo "[title]$title"
"#;
        fs::write(&script_path, script)?;
        #[cfg(unix)]
        {
            let mut perms = fs::metadata(&script_path)?.permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&script_path, perms)?;
        }
        Ok(script_path)
    }

    #[test]
    fn classify_line_recognises_markers() {
        assert_eq!(
            classify_line("[title]Some: Title"),
            OutputLine::Title("Some: Title")
        );
        assert_eq!(
            classify_line("[progress]  42.5%"),
            OutputLine::Event(DownloadEvent::Progress { percent: 42.5 })
        );
        assert_eq!(classify_line("[progress] Unknown %"), OutputLine::Blank);
        assert_eq!(
            classify_line("ERROR: [youtube] x: Video unavailable\r"),
            OutputLine::Event(DownloadEvent::Error(
                "ERROR: [youtube] x: Video unavailable".into()
            ))
        );
        assert_eq!(
            classify_line("WARNING: nsig extraction failed"),
            OutputLine::Event(DownloadEvent::Warning(
                "WARNING: nsig extraction failed".into()
            ))
        );
        assert_eq!(
            classify_line("[Merger] Merging formats"),
            OutputLine::Event(DownloadEvent::Info("[Merger] Merging formats".into()))
        );
        assert_eq!(classify_line("   "), OutputLine::Blank);
    }

    #[test]
    fn command_requests_merged_mp4() {
        let ytdlp = YtDlp::with_program("yt-dlp");
        let command = ytdlp.command("https://www.youtube.com/watch?v=abc", Path::new("out"));
        let args: Vec<String> = command
            .get_args()
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect();

        let value_after = |flag: &str| {
            args.iter()
                .position(|arg| arg == flag)
                .and_then(|index| args.get(index + 1))
                .cloned()
        };
        assert_eq!(value_after("--format").as_deref(), Some(FORMAT_SELECTOR));
        assert_eq!(value_after("--merge-output-format").as_deref(), Some("mp4"));
        assert_eq!(value_after("--recode-video").as_deref(), Some("mp4"));
        assert_eq!(
            value_after("--output").map(PathBuf::from),
            Some(Path::new("out").join(OUTPUT_TEMPLATE))
        );
        assert_eq!(
            args.last().map(String::as_str),
            Some("https://www.youtube.com/watch?v=abc")
        );
    }

    #[cfg(unix)]
    #[test]
    fn download_reports_title_and_events() -> Result<()> {
        let temp = tempdir()?;
        let stub = install_ytdlp_stub(temp.path())?;
        let out = temp.path().join("out");
        fs::create_dir_all(&out)?;

        let mut observer = RecordingObserver::default();
        let outcome = YtDlp::with_program(stub).download(
            "https://www.youtube.com/watch?v=v1",
            &out,
            &mut observer,
        );

        assert_eq!(
            outcome,
            DownloadOutcome::Completed {
                title: "A".to_string()
            }
        );
        assert!(out.join("A.mp4").exists());
        assert!(
            observer
                .events
                .contains(&DownloadEvent::Progress { percent: 100.0 })
        );
        assert!(
            observer
                .events
                .contains(&DownloadEvent::Warning("WARNING: stub warning".into()))
        );
        assert!(observer.errors().is_empty());

        let recorded = fs::read_to_string(temp.path().join("last-args.txt"))?;
        assert!(recorded.lines().any(|line| line == FORMAT_SELECTOR));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn download_keeps_title_as_reported() -> Result<()> {
        let temp = tempdir()?;
        let stub = install_ytdlp_stub(temp.path())?;

        let mut observer = RecordingObserver::default();
        let outcome = YtDlp::with_program(stub).download(
            "https://www.youtube.com/watch?v=other",
            temp.path(),
            &mut observer,
        );

        assert_eq!(
            outcome,
            DownloadOutcome::Completed {
                title: "Stub: Title".to_string()
            }
        );
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn invalid_utf8_output_does_not_hide_title() -> Result<()> {
        let temp = tempdir()?;
        let stub = install_ytdlp_stub(temp.path())?;

        let mut observer = RecordingObserver::default();
        let outcome = YtDlp::with_program(stub).download(
            "https://www.youtube.com/watch?v=badbytes",
            temp.path(),
            &mut observer,
        );

        assert_eq!(
            outcome,
            DownloadOutcome::Completed {
                title: "Stub: Title".to_string()
            }
        );
        assert!(
            observer
                .events
                .contains(&DownloadEvent::Info("[info] \u{FFFD}".into()))
        );
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn failing_download_reports_error_event() -> Result<()> {
        let temp = tempdir()?;
        let stub = install_ytdlp_stub(temp.path())?;

        let mut observer = RecordingObserver::default();
        let outcome = YtDlp::with_program(stub).download(
            "https://www.youtube.com/watch?v=fail",
            temp.path(),
            &mut observer,
        );

        assert_eq!(outcome, DownloadOutcome::Failed);
        let errors = observer.errors();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("Video unavailable"));
        assert!(errors[1].starts_with("Error downloading video:"));
        Ok(())
    }

    #[cfg(unix)]
    #[test]
    fn missing_title_counts_as_failure() -> Result<()> {
        let temp = tempdir()?;
        let stub = install_ytdlp_stub(temp.path())?;

        let mut observer = RecordingObserver::default();
        let outcome = YtDlp::with_program(stub).download(
            "https://www.youtube.com/watch?v=notitle",
            temp.path(),
            &mut observer,
        );

        assert_eq!(outcome, DownloadOutcome::Failed);
        assert!(observer.errors()[0].contains("did not report a title"));
        Ok(())
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let mut observer = RecordingObserver::default();
        let outcome = YtDlp::with_program("/nonexistent/yt-dlp").download(
            "https://www.youtube.com/watch?v=abc",
            Path::new("."),
            &mut observer,
        );
        assert_eq!(outcome, DownloadOutcome::Failed);
        assert_eq!(observer.errors().len(), 1);
    }

    #[test]
    fn ensure_program_available_rejects_missing_binary() {
        let err = ensure_program_available(Path::new("/nonexistent/yt-dlp"), "--version")
            .unwrap_err();
        assert!(err.to_string().contains("not installed"));
    }

    #[test]
    fn tracing_observer_accepts_every_event_kind() {
        let mut observer = TracingObserver::new();
        observer.on_event(DownloadEvent::Info("info".into()));
        observer.on_event(DownloadEvent::Warning("warning".into()));
        observer.on_event(DownloadEvent::Error("error".into()));
        observer.on_event(DownloadEvent::Progress { percent: 30.0 });
        observer.on_event(DownloadEvent::Progress { percent: 40.0 });
        assert_eq!(observer.last_reported_step, Some(1));
    }

    #[test]
    fn tracing_observer_logs_each_download_from_scratch() {
        let mut observer = TracingObserver::new();
        observer.on_start("https://www.youtube.com/watch?v=first");
        assert!(observer.enters_new_step(100.0));
        assert!(!observer.enters_new_step(100.0));

        observer.on_start("https://www.youtube.com/watch?v=second");
        assert!(observer.enters_new_step(100.0));
    }

    #[cfg(unix)]
    #[test]
    fn download_signals_start_to_observer() -> Result<()> {
        let temp = tempdir()?;
        let stub = install_ytdlp_stub(temp.path())?;

        let mut observer = TracingObserver::new();
        observer.on_event(DownloadEvent::Progress { percent: 100.0 });
        YtDlp::with_program(stub).download(
            "https://www.youtube.com/watch?v=fail",
            temp.path(),
            &mut observer,
        );
        assert_eq!(observer.last_reported_step, None);
        Ok(())
    }
}
