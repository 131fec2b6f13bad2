use keyop_core::os::{CommandHandle, CommandOutput, Metadata, Os};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

/// An in-memory filesystem double for [`Os`], so bus/bridge tests run
/// hermetically without touching the real disk.
///
/// Scriptable: construct with [`FakeOs::new`], seed files directly via
/// [`FakeOs::seed_file`], and inspect writes via [`FakeOs::file`].
pub struct FakeOs {
    hostname: String,
    files: Mutex<HashMap<PathBuf, (Vec<u8>, SystemTime)>>,
    home_dir: PathBuf,
    now: Mutex<SystemTime>,
}

impl FakeOs {
    pub fn new(hostname: impl Into<String>) -> Self {
        FakeOs {
            hostname: hostname.into(),
            files: Mutex::new(HashMap::new()),
            home_dir: PathBuf::from("/home/test"),
            now: Mutex::new(SystemTime::now()),
        }
    }

    pub fn seed_file(&self, path: impl Into<PathBuf>, contents: impl Into<Vec<u8>>) {
        let now = *self.now.lock().unwrap();
        self.files
            .lock()
            .unwrap()
            .insert(path.into(), (contents.into(), now));
    }

    pub fn file(&self, path: impl AsRef<Path>) -> Option<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path.as_ref())
            .map(|(bytes, _)| bytes.clone())
    }

    pub fn set_now(&self, now: SystemTime) {
        *self.now.lock().unwrap() = now;
    }
}

impl Os for FakeOs {
    fn hostname(&self) -> io::Result<String> {
        Ok(self.hostname.clone())
    }

    fn user_home_dir(&self) -> io::Result<PathBuf> {
        Ok(self.home_dir.clone())
    }

    fn read_file(&self, path: &Path) -> io::Result<Vec<u8>> {
        self.files
            .lock()
            .unwrap()
            .get(path)
            .map(|(bytes, _)| bytes.clone())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn write_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let now = *self.now.lock().unwrap();
        self.files
            .lock()
            .unwrap()
            .insert(path.to_path_buf(), (contents.to_vec(), now));
        Ok(())
    }

    fn append_file(&self, path: &Path, contents: &[u8]) -> io::Result<()> {
        let now = *self.now.lock().unwrap();
        let mut files = self.files.lock().unwrap();
        let entry = files
            .entry(path.to_path_buf())
            .or_insert_with(|| (Vec::new(), now));
        entry.0.extend_from_slice(contents);
        entry.1 = now;
        Ok(())
    }

    fn rename(&self, from: &Path, to: &Path) -> io::Result<()> {
        let mut files = self.files.lock().unwrap();
        let value = files
            .remove(from)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        files.insert(to.to_path_buf(), value);
        Ok(())
    }

    fn stat(&self, path: &Path) -> io::Result<Metadata> {
        let files = self.files.lock().unwrap();
        let (bytes, modified) = files
            .get(path)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        Ok(Metadata {
            len: bytes.len() as u64,
            modified: *modified,
            is_dir: false,
        })
    }

    fn mkdir_all(&self, _path: &Path) -> io::Result<()> {
        Ok(())
    }

    fn read_dir(&self, path: &Path) -> io::Result<Vec<PathBuf>> {
        let files = self.files.lock().unwrap();
        Ok(files
            .keys()
            .filter(|p| p.parent() == Some(path))
            .cloned()
            .collect())
    }

    fn remove(&self, path: &Path) -> io::Result<()> {
        self.files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }

    fn chtimes(&self, path: &Path, modified: SystemTime) -> io::Result<()> {
        let mut files = self.files.lock().unwrap();
        let entry = files
            .get_mut(path)
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        entry.1 = modified;
        Ok(())
    }

    fn command(&self, _name: &str) -> Box<dyn CommandHandle> {
        Box::new(FakeCommandHandle::default())
    }
}

#[derive(Default)]
struct FakeCommandHandle {
    args: Vec<String>,
}

impl CommandHandle for FakeCommandHandle {
    fn arg(mut self: Box<Self>, arg: &str) -> Box<dyn CommandHandle> {
        self.args.push(arg.to_string());
        self
    }

    fn run(self: Box<Self>) -> io::Result<()> {
        Ok(())
    }

    fn output(self: Box<Self>) -> io::Result<CommandOutput> {
        Ok(CommandOutput::default())
    }

    fn combined_output(self: Box<Self>) -> io::Result<CommandOutput> {
        Ok(CommandOutput::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_then_read_round_trips() {
        let os = FakeOs::new("fakehost");
        os.append_file(Path::new("/a/b.jsonl"), b"line1\n").unwrap();
        os.append_file(Path::new("/a/b.jsonl"), b"line2\n").unwrap();
        let contents = os.read_file(Path::new("/a/b.jsonl")).unwrap();
        assert_eq!(contents, b"line1\nline2\n");
    }

    #[test]
    fn rename_moves_contents() {
        let os = FakeOs::new("fakehost");
        os.write_file(Path::new("/a.tmp"), b"data").unwrap();
        os.rename(Path::new("/a.tmp"), Path::new("/a.json")).unwrap();
        assert!(os.read_file(Path::new("/a.tmp")).is_err());
        assert_eq!(os.read_file(Path::new("/a.json")).unwrap(), b"data");
    }
}
