use chrono::Local;
use env_logger::{Builder, Env, Target};
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Copies every log line to stderr and, when available, a log file.
struct TeeWriter {
    file: Option<File>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Some(file) = self.file.as_mut() {
            // A failing log file must not take console logging down with it.
            if file.write_all(buf).is_err() {
                self.file = None;
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stderr().flush()?;
        if let Some(file) = self.file.as_mut() {
            file.flush()?;
        }
        Ok(())
    }
}

fn open_log_file(logs_dir: &Path, run_kind: &str) -> io::Result<(File, PathBuf)> {
    fs::create_dir_all(logs_dir)?;
    let path = logs_dir.join(format!(
        "{}_{}.log",
        run_kind,
        Local::now().format("%Y%m%d_%H%M%S")
    ));
    let file = File::create(&path)?;
    Ok((file, path))
}

/// Installs the global logger. `RUST_LOG` overrides the default `info` level.
///
/// Returns the log file path, or `None` when only the console is in use.
pub fn init(logs_dir: &Path, run_kind: &str) -> Option<PathBuf> {
    let (file, path, open_error) = match open_log_file(logs_dir, run_kind) {
        Ok((file, path)) => (Some(file), Some(path), None),
        Err(e) => (None, None, Some(e)),
    };

    Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            writeln!(
                buf,
                "{} - {} - {}",
                Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                record.level(),
                record.args()
            )
        })
        .target(Target::Pipe(Box::new(TeeWriter { file })))
        .init();

    if let Some(e) = open_error {
        log::warn!(
            "Could not create log file in {}, logging to console only: {}",
            logs_dir.display(),
            e
        );
    }

    path
}
