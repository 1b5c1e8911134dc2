//! The §4.7 Windows layer tar writer.

use std::collections::BTreeSet;
use std::io::{Read, Write};

use tar::{Builder, Header};

use crate::error::{Error, Result};

/// Writer factory for layer tars: plain for any non-Windows image, wrapped for Windows
/// per §4.7.
pub enum LayerWriter<W: Write> {
    /// Writes entries through unmodified.
    Plain(Builder<W>),
    /// Re-parents and validates entries per the Windows base-layer shape.
    Windows(WindowsLayerWriter<W>),
}

impl<W: Write> LayerWriter<W> {
    /// Build the writer appropriate for `os`.
    pub fn for_os(os: &str, inner: W) -> Self {
        if os == "windows" {
            Self::Windows(WindowsLayerWriter::new(inner))
        } else {
            Self::Plain(Builder::new(inner))
        }
    }

    /// Append one entry. `name` must be an absolute POSIX path (`/foo/bar`).
    pub fn append(&mut self, name: &str, header: &mut Header, data: impl Read) -> Result<()> {
        match self {
            Self::Plain(builder) => {
                header.set_cksum();
                builder.append_data(header, name.trim_start_matches('/'), data)?;
                Ok(())
            }
            Self::Windows(writer) => writer.append(name, header, data),
        }
    }

    /// Finish the archive, flushing the Windows synthesized directories if applicable.
    pub fn finish(self) -> Result<W> {
        match self {
            Self::Plain(builder) => Ok(builder.into_inner()?),
            Self::Windows(writer) => writer.finish(),
        }
    }
}

/// Wraps a tar builder so every entry lands under `Files/`, rejecting non-absolute-POSIX
/// names, and synthesizes the `Files` and `Hives` top-level directories plus every
/// intermediate directory exactly once, even for an archive that otherwise writes nothing.
pub struct WindowsLayerWriter<W: Write> {
    builder: Builder<W>,
    emitted_dirs: BTreeSet<String>,
    header_written: bool,
}

impl<W: Write> WindowsLayerWriter<W> {
    /// Wrap `inner`. Does not write anything until the first `append` or `finish`.
    pub fn new(inner: W) -> Self {
        Self {
            builder: Builder::new(inner),
            emitted_dirs: BTreeSet::new(),
            header_written: false,
        }
    }

    fn ensure_top_level(&mut self) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        self.header_written = true;
        self.append_dir("Files")?;
        self.append_dir("Hives")?;
        Ok(())
    }

    fn append_dir(&mut self, name: &str) -> Result<()> {
        if !self.emitted_dirs.insert(name.to_owned()) {
            return Ok(());
        }
        let mut header = Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_size(0);
        header.set_mode(0o755);
        header.set_cksum();
        self.builder.append_data(&mut header, format!("{name}/"), std::io::empty())?;
        Ok(())
    }

    /// Validate, re-parent under `Files/`, and append one entry, synthesizing any
    /// intermediate directories not yet emitted.
    pub fn append(&mut self, name: &str, header: &mut Header, data: impl Read) -> Result<()> {
        validate_path(name)?;
        self.ensure_top_level()?;

        let relative = name.trim_start_matches('/');
        let mut prefix = String::from("Files");
        if let Some((parent, _)) = relative.rsplit_once('/') {
            for segment in parent.split('/') {
                prefix.push('/');
                prefix.push_str(segment);
                self.append_dir(&prefix)?;
            }
        }

        header.set_cksum();
        self.builder.append_data(header, format!("Files/{relative}"), data)?;
        Ok(())
    }

    /// Close the archive. Synthesizes `Files`/`Hives` even if no entry was ever appended,
    /// per §4.7's "both are emitted on close even for an empty layer".
    pub fn finish(mut self) -> Result<W> {
        self.ensure_top_level()?;
        Ok(self.builder.into_inner()?)
    }
}

/// Reject any header name that is not an absolute POSIX path.
fn validate_path(name: &str) -> Result<()> {
    if name.contains(':') || name.contains('\\') || !name.starts_with('/') {
        return Err(Error::InvalidPath(name.to_owned()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::WindowsLayerWriter;
    use tar::Header;

    fn entry_names(bytes: &[u8]) -> Vec<String> {
        let mut archive = tar::Archive::new(bytes);
        archive
            .entries()
            .expect("entries")
            .map(|e| e.expect("entry").path().expect("path").to_string_lossy().into_owned())
            .collect()
    }

    /// Concrete scenario 4: two files under distinct parents synthesize `Files`, `Hives`,
    /// and each intermediate directory exactly once, in order, before any file entry.
    #[test]
    fn scenario_4_windows_writer_synthesizes_directories() {
        let mut writer = WindowsLayerWriter::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_size(0);
        header.set_mode(0o644);
        writer
            .append("/cnb/lifecycle/first-file", &mut header, std::io::empty())
            .expect("append");
        let mut header2 = Header::new_gnu();
        header2.set_size(0);
        header2.set_mode(0o644);
        writer
            .append("/cnb/sibling-dir", &mut header2, std::io::empty())
            .expect("append");

        let bytes = writer.finish().expect("finish");
        let names = entry_names(&bytes);
        assert_eq!(
            names,
            vec![
                "Files/".to_owned(),
                "Hives/".to_owned(),
                "Files/cnb/".to_owned(),
                "Files/cnb/lifecycle/".to_owned(),
                "Files/cnb/lifecycle/first-file".to_owned(),
                "Files/cnb/sibling-dir".to_owned(),
            ]
        );
    }

    #[test]
    fn rejects_windows_style_path() {
        let mut writer = WindowsLayerWriter::new(Vec::new());
        let mut header = Header::new_gnu();
        header.set_size(0);
        let err = writer
            .append("c:\\x.txt", &mut header, std::io::empty())
            .expect_err("must fail");
        assert!(matches!(err, crate::error::Error::InvalidPath(_)));
    }

    #[test]
    fn empty_layer_still_emits_files_and_hives() {
        let writer = WindowsLayerWriter::new(Vec::new());
        let bytes = writer.finish().expect("finish");
        let names = entry_names(&bytes);
        assert_eq!(names, vec!["Files/".to_owned(), "Hives/".to_owned()]);
    }
}
