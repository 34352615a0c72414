//! Contents-file recorder.
//!
//! One line per installed entry, `key=value` pairs separated by spaces:
//!
//! ```text
//! type=dir path=/etc
//! type=file path=/etc/foo.conf sha256=<hex> mtime=<secs>
//! type=sym path=/usr/lib/libx.so target=libx.so.1 mtime=<secs>
//! ```

use std::io::{self, Write};
use std::path::Path;

use imerge_core::{RecordKind, RecordedEntry, Recorder};

/// A [`Recorder`] that appends every entry to a contents stream.
#[derive(Debug)]
pub struct ContentsRecorder<W: Write> {
    out: W,
    entries: usize,
}

impl<W: Write> ContentsRecorder<W> {
    #[must_use]
    pub const fn new(out: W) -> Self {
        Self { out, entries: 0 }
    }

    /// Number of lines written so far.
    #[must_use]
    pub const fn entries(&self) -> usize {
        self.entries
    }

    /// Flush and hand back the underlying writer.
    ///
    /// # Errors
    /// Returns the flush error.
    pub fn finish(mut self) -> io::Result<W> {
        self.out.flush()?;
        Ok(self.out)
    }

    fn write_entry(&mut self, entry: &RecordedEntry) -> io::Result<()> {
        let mut line = match &entry.kind {
            RecordKind::Dir => b"type=dir".to_vec(),
            RecordKind::File { .. } => b"type=file".to_vec(),
            RecordKind::Symlink { .. } => b"type=sym".to_vec(),
        };
        line.extend_from_slice(b" path=");
        line.extend(escape(&entry.path));
        match &entry.kind {
            RecordKind::Dir => {}
            RecordKind::File {
                content_hash,
                mtime,
                ..
            } => line.extend(format!(" sha256={content_hash} mtime={mtime}").into_bytes()),
            RecordKind::Symlink { target, mtime } => {
                line.extend_from_slice(b" target=");
                line.extend(escape(target));
                line.extend(format!(" mtime={mtime}").into_bytes());
            }
        }
        line.push(b'\n');
        self.out.write_all(&line)
    }
}

impl<W: Write> Recorder for ContentsRecorder<W> {
    fn record(&mut self, entry: &RecordedEntry) -> Result<(), String> {
        self.write_entry(entry)
            .map_err(|e| format!("failed to write contents entry: {e}"))?;
        self.entries += 1;
        Ok(())
    }
}

/// Escape a path for a contents line.
///
/// `[A-Za-z0-9/._-]` pass through, newline becomes `\n`, every other byte
/// is backslash-prefixed and kept as-is, so names that are not ASCII (or
/// not UTF-8) survive byte for byte.
#[must_use]
pub fn escape(path: &Path) -> Vec<u8> {
    use std::os::unix::ffi::OsStrExt as _;

    let bytes = path.as_os_str().as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    for &b in bytes {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'/' | b'.' | b'_' | b'-' => out.push(b),
            b'\n' => out.extend_from_slice(b"\\n"),
            _ => {
                out.push(b'\\');
                out.push(b);
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::ffi::OsString;
    use std::path::PathBuf;

    use imerge_core::MergeStatus;

    use super::*;

    fn file(path: &str, installed_as: Option<&str>) -> RecordedEntry {
        RecordedEntry {
            path: PathBuf::from(path),
            status: MergeStatus::RENAMED,
            kind: RecordKind::File {
                installed_as: installed_as.map(OsString::from),
                content_hash: "ab".repeat(32),
                mtime: 1_700_000_000,
            },
        }
    }

    fn written(entries: &[RecordedEntry]) -> String {
        let mut rec = ContentsRecorder::new(Vec::new());
        for e in entries {
            rec.record(e).unwrap();
        }
        assert_eq!(rec.entries(), entries.len());
        String::from_utf8(rec.finish().unwrap()).unwrap()
    }

    #[test]
    fn writes_one_line_per_kind() {
        let out = written(&[
            RecordedEntry {
                path: PathBuf::from("/usr/lib"),
                status: MergeStatus::USED_EXISTING,
                kind: RecordKind::Dir,
            },
            file("/usr/lib/libx.so.1", None),
            RecordedEntry {
                path: PathBuf::from("/usr/lib/libx.so"),
                status: MergeStatus::RENAMED,
                kind: RecordKind::Symlink {
                    target: PathBuf::from("libx.so.1"),
                    mtime: 42,
                },
            },
        ]);
        let hash = "ab".repeat(32);
        assert_eq!(
            out,
            format!(
                "type=dir path=/usr/lib\n\
                 type=file path=/usr/lib/libx.so.1 sha256={hash} mtime=1700000000\n\
                 type=sym path=/usr/lib/libx.so target=libx.so.1 mtime=42\n"
            )
        );
    }

    #[test]
    fn protected_file_records_logical_path() {
        let out = written(&[file("/etc/foo.conf", Some("._cfg0000_foo.conf"))]);
        assert!(out.starts_with("type=file path=/etc/foo.conf sha256="));
        assert!(!out.contains("._cfg"));
    }

    #[test]
    fn escape_keeps_safe_characters() {
        assert_eq!(escape(Path::new("/usr/lib/libx-1.2_3.so")), b"/usr/lib/libx-1.2_3.so");
    }

    #[test]
    fn escape_spaces_newlines_and_backslashes() {
        assert_eq!(escape(Path::new("/a b")), b"/a\\ b");
        assert_eq!(escape(Path::new("/a\nb")), b"/a\\nb");
        assert_eq!(escape(Path::new("/a\\b")), b"/a\\\\b");
        assert_eq!(escape(Path::new("/x=y")), b"/x\\=y");
    }

    #[test]
    fn escape_keeps_utf8_bytes() {
        assert_eq!(
            escape(Path::new("/etc/café.conf")),
            b"/etc/caf\\\xc3\\\xa9.conf"
        );
    }

    #[test]
    fn non_utf8_names_are_written_byte_for_byte() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt as _;

        let mut rec = ContentsRecorder::new(Vec::new());
        rec.record(&RecordedEntry {
            path: PathBuf::from(OsStr::from_bytes(b"/srv/\xff\xfe")),
            status: MergeStatus::RENAMED,
            kind: RecordKind::Dir,
        })
        .unwrap();
        assert_eq!(rec.finish().unwrap(), b"type=dir path=/srv/\\\xff\\\xfe\n");
    }

    #[test]
    fn write_failure_is_reported() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::other("disk full"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }
        let mut rec = ContentsRecorder::new(Broken);
        let err = rec.record(&file("/etc/foo", None)).unwrap_err();
        assert!(err.contains("disk full"), "{err}");
        assert_eq!(rec.entries(), 0);
    }

    mod escape_props {
        use proptest::prelude::*;

        use super::*;

        proptest! {
            #[test]
            fn escaped_output_is_single_line(s in "[ -~\n\té]{0,40}") {
                let escaped = escape(Path::new(&s));
                prop_assert!(!escaped.contains(&b'\n'));
                prop_assert!(escaped.len() >= s.len());
            }
        }
    }
}
