use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Output of a completed child process, mirroring `std::process::Output`
/// minus its dependency on `std::process::ExitStatus` so fakes can
/// construct one without spawning anything.
#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status_code == 0
    }
}

/// A single invocable command, built by [`Os::command`].
pub trait CommandHandle {
    fn arg(self: Box<Self>, arg: &str) -> Box<dyn CommandHandle>;
    fn run(self: Box<Self>) -> io::Result<()>;
    fn output(self: Box<Self>) -> io::Result<CommandOutput>;
    fn combined_output(self: Box<Self>) -> io::Result<CommandOutput>;
}

/// Thin, fully mockable façade over the filesystem, hostname lookup,
/// and subprocess execution. Every filesystem touch in the bus and the
/// bridges goes through this seam so tests can run hermetically
/// against an in-memory fake instead of the real disk.
pub trait Os: Send + Sync {
    fn hostname(&self) -> io::Result<String>;
    fn user_home_dir(&self) -> io::Result<PathBuf>;
    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>>;
    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    /// Append `contents` to `path`, creating it if missing. The only
    /// method the channel log writer uses — never read-modify-write.
    fn append_file(&self, path: &Path, contents: &[u8]) -> io::Result<()>;
    fn rename(&self, from: &Path, to: &Path) -> io::Result<()>;
    fn stat(&self, path: &Path) -> io::Result<Metadata>;
    fn mkdir_all(&self, path: &Path) -> io::Result<()>;
    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>>;
    fn remove(&self, path: &Path) -> io::Result<()>;
    fn chtimes(&self, path: &Path, modified: SystemTime) -> io::Result<()>;
    fn command(&self, name: &str) -> Box<dyn CommandHandle>;
}

/// File metadata surface the bus and config loader actually consult.
#[derive(Debug, Clone, Copy)]
pub struct Metadata {
    pub len: u64,
    pub modified: SystemTime,
    pub is_dir: bool,
}

/// The real, process-wide implementation, backed by `std::fs` and
/// `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealOs;

impl Os for RealOs {
    fn hostname(&self) -> io::Result<String> {
        hostname::get().map(|s| s.to_string_lossy().into_owned())
    }

    fn user_home_dir(&self) -> io::Result<PathBuf> {
        dirs::home_dir().ok_or_else(|| io::Error::other("no home directory"))
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        std::fs::read(path)
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        std::fs::write(path, contents)
    }

    fn append_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        file.write_all(contents)?;
        file.flush()?;
        file.sync_data()
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        std::fs::rename(from, to)
    }

    fn stat(&self, path: &Path) -> io::Result<Metadata> {
        let m = std::fs::metadata(path)?;
        Ok(Metadata {
            len: m.len(),
            modified: m.modified()?,
            is_dir: m.is_dir(),
        })
    }

    fn mkdir_all(&self, path: &Path) -> io::Result<()> {
        std::fs::create_dir_all(path)
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        std::fs::read_dir(path)?
            .map(|entry| entry.map(|e| e.path()))
            .collect()
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        std::fs::remove_file(path)
    }

    fn chtimes(&self, path: &Path, modified: SystemTime) -> io::Result<()> {
        let file = std::fs::File::open(path)?;
        file.set_modified(modified)
    }

    fn command(&self, name: &str) -> Box<dyn CommandHandle> {
        Box::new(RealCommandHandle(std::process::Command::new(name)))
    }
}

struct RealCommandHandle(std::process::Command);

impl CommandHandle for RealCommandHandle {
    fn arg(mut self: Box<Self>, arg: &str) -> Box<dyn CommandHandle> {
        self.0.arg(arg);
        self
    }

    fn run(mut self: Box<Self>) -> io::Result<()> {
        self.0.status().map(|_| ())
    }

    fn output(mut self: Box<Self>) -> io::Result<CommandOutput> {
        let out = self.0.output()?;
        Ok(CommandOutput {
            status_code: out.status.code().unwrap_or(-1),
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    fn combined_output(mut self: Box<Self>) -> io::Result<CommandOutput> {
        self.0.stderr(std::process::Stdio::piped());
        self.output()
    }
}
