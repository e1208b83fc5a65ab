//! Image file naming and sequence numbering.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk image encoding.
///
/// The numeric codes are part of the remote image server header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
    Fits,
    Mef,
    Binary,
}

impl FileType {
    /// Code sent in the remote image server header.
    pub fn code(&self) -> u8 {
        match self {
            FileType::Fits => 0,
            FileType::Mef => 1,
            FileType::Binary => 2,
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            FileType::Fits | FileType::Mef => "fits",
            FileType::Binary => "bin",
        }
    }
}

/// Generates image file names of the form `<root><seq>.<ext>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageFilename {
    pub folder: PathBuf,
    pub root: String,
    pub sequence_number: u32,
    pub include_sequence_number: bool,
    pub auto_increment: bool,
    /// Overwrite an existing file of the same name
    pub overwrite: bool,
    /// Test images are always overwritten
    pub test_image: bool,
}

impl ImageFilename {
    pub fn new(folder: impl Into<PathBuf>, root: &str) -> Self {
        Self {
            folder: folder.into(),
            root: root.to_string(),
            sequence_number: 1,
            include_sequence_number: true,
            auto_increment: true,
            overwrite: false,
            test_image: false,
        }
    }

    /// Use a fixed file name with no sequence number.
    ///
    /// A name with a directory component replaces the folder.
    pub fn set_fixed_name(&mut self, name: &str) {
        let path = Path::new(name);
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            self.folder = parent.to_path_buf();
        }
        self.root = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(name)
            .to_string();
        self.include_sequence_number = false;
        self.auto_increment = false;
    }

    /// Bare file name for the current sequence number.
    pub fn file_name(&self, file_type: FileType) -> String {
        if self.test_image {
            return format!("test.{}", file_type.extension());
        }
        if self.include_sequence_number {
            format!(
                "{}{:04}.{}",
                self.root,
                self.sequence_number,
                file_type.extension()
            )
        } else {
            format!("{}.{}", self.root, file_type.extension())
        }
    }

    /// Full path of the current image.
    pub fn path(&self, file_type: FileType) -> PathBuf {
        self.folder.join(self.file_name(file_type))
    }

    /// Name announced to a remote image server.
    ///
    /// A leading `!` asks the server to overwrite an existing file.
    pub fn remote_name(&self, file_type: FileType) -> String {
        let name = self.path(file_type).display().to_string();
        if self.overwrite || self.test_image {
            format!("!{name}")
        } else {
            name
        }
    }

    /// Advance the sequence number if auto-increment is enabled.
    pub fn increment(&mut self) {
        if self.auto_increment {
            self.sequence_number += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_names() {
        let mut name = ImageFilename::new("/data/bluechan", "bc.");
        assert_eq!(name.file_name(FileType::Fits), "bc.0001.fits");
        name.increment();
        assert_eq!(
            name.path(FileType::Binary),
            PathBuf::from("/data/bluechan/bc.0002.bin")
        );
    }

    #[test]
    fn test_fixed_name_disables_increment() {
        let mut name = ImageFilename::new("/data", "x");
        name.set_fixed_name("/home/obs/a001.fits");
        name.increment();
        assert_eq!(name.path(FileType::Fits), PathBuf::from("/home/obs/a001.fits"));
        assert_eq!(name.sequence_number, 1);
    }

    #[test]
    fn test_remote_name_overwrite_prefix() {
        let mut name = ImageFilename::new("/data", "img");
        assert!(!name.remote_name(FileType::Fits).starts_with('!'));
        name.overwrite = true;
        assert_eq!(name.remote_name(FileType::Fits), "!/data/img0001.fits");
        assert_eq!(FileType::Mef.code(), 1);
    }
}
