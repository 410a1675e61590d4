//! Stores uploaded files and turns them into flag values

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use log::{debug, info};
use serde::Serialize;
use tempfile::TempDir;
use thiserror::Error;
use uuid::Uuid;

use crate::commands::flag::{FlagType, UnknownFlagType, write_csv_record};

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("while parsing upload form: {0}")]
    Form(#[from] multer::Error),
    #[error("upload form is missing the `{0}` field")]
    MissingField(&'static str),
    #[error("no files were uploaded for --{0}")]
    NoFiles(String),
    #[error(transparent)]
    UnknownType(#[from] UnknownFlagType),
    #[error("failed creating upload directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("failed opening/copying uploaded file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}

impl UploadError {
    /// HTTP status for this error. A malformed form is a client error unless
    /// the legacy mapping, which reports every upload failure as 500, is requested.
    #[must_use]
    pub fn status(&self, legacy: bool) -> u16 {
        match self {
            UploadError::Directory { .. } | UploadError::Io { .. } => 500,
            _ if legacy => 500,
            _ => 400,
        }
    }
}

/// One file part of an upload form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedFile {
    pub file_name: String,
    pub data: Vec<u8>,
}

/// Parsed `POST /upload` form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadForm {
    pub flag: String,
    pub flag_type: FlagType,
    pub files: Vec<UploadedFile>,
}

/// Body of a successful upload response
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResponse {
    pub path: String,
}

/// Process-lifetime storage for uploaded files
#[derive(Debug)]
pub struct UploadStore {
    dir: PathBuf,
    // Removed together with its contents when the store is dropped
    _temp: Option<TempDir>,
}

impl UploadStore {
    /// Store uploads in a fresh temporary directory.
    ///
    /// # Errors
    ///
    /// Returns `UploadError::Directory` if the directory cannot be created.
    pub fn temporary() -> Result<Self, UploadError> {
        let temp = tempfile::Builder::new()
            .prefix("treegui")
            .tempdir()
            .map_err(|source| UploadError::Directory {
                path: std::env::temp_dir(),
                source,
            })?;
        debug!("Storing uploads in {}", temp.path().display());
        Ok(UploadStore {
            dir: temp.path().to_path_buf(),
            _temp: Some(temp),
        })
    }

    /// Store uploads in `dir`, creating it if needed. Files are left in place on exit.
    ///
    /// # Errors
    ///
    /// Returns `UploadError::Directory` if the directory cannot be created.
    pub fn in_dir(dir: impl Into<PathBuf>) -> Result<Self, UploadError> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir).map_err(|source| UploadError::Directory {
            path: dir.clone(),
            source,
        })?;
        Ok(UploadStore { dir, _temp: None })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Persist `data` under a unique name derived from `file_name`.
    ///
    /// # Errors
    ///
    /// Returns `UploadError::Io` if the file cannot be created or written. A
    /// partially written file is left behind.
    pub fn store(&self, file_name: &str, mut data: impl Read) -> Result<PathBuf, UploadError> {
        let path = self
            .dir
            .join(format!("{}-{}", Uuid::new_v4(), sanitize_file_name(file_name)));
        let io_err = |source| UploadError::Io {
            path: path.clone(),
            source,
        };
        let mut file = File::create(&path).map_err(io_err)?;
        io::copy(&mut data, &mut file).map_err(io_err)?;
        Ok(path)
    }

    /// Store every file of the form and encode the stored paths as the flag's value.
    ///
    /// # Errors
    ///
    /// Returns `UploadError` if the form has no files or storing fails.
    pub fn accept(&self, form: &UploadForm) -> Result<UploadResponse, UploadError> {
        if form.files.is_empty() {
            return Err(UploadError::NoFiles(form.flag.clone()));
        }
        let paths = form
            .files
            .iter()
            .map(|f| self.store(&f.file_name, f.data.as_slice()))
            .collect::<Result<Vec<_>, _>>()?;
        info!(
            "Stored {} upload(s) for --{} in {}",
            paths.len(),
            form.flag,
            self.dir.display()
        );
        let path = encode_paths(form.flag_type, &paths)
            .ok_or_else(|| UploadError::NoFiles(form.flag.clone()))?;
        Ok(UploadResponse { path })
    }
}

/// Flag value for stored uploads: the single path for scalar flags, a CSV
/// record of every path for list flags. `None` when there are no paths.
#[must_use]
pub fn encode_paths(flag_type: FlagType, paths: &[PathBuf]) -> Option<String> {
    let strings: Vec<String> = paths.iter().map(|p| p.display().to_string()).collect();
    if flag_type.is_list() {
        (!strings.is_empty()).then(|| write_csv_record(&strings))
    } else {
        strings.into_iter().next()
    }
}

/// Keep only the final path component, made of characters safe on any filesystem
fn sanitize_file_name(name: &str) -> String {
    let base = Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.trim_matches('.').is_empty() {
        "upload".to_string()
    } else {
        cleaned
    }
}

/// Parse a buffered `multipart/form-data` upload body.
///
/// # Errors
///
/// Returns `UploadError` for a malformed form, a missing `name` or `type`
/// field, or an unknown type hint.
pub fn parse_upload(content_type: &str, body: Vec<u8>) -> Result<UploadForm, UploadError> {
    let boundary = multer::parse_boundary(content_type)?;
    futures::executor::block_on(read_form(boundary, body))
}

async fn read_form(boundary: String, body: Vec<u8>) -> Result<UploadForm, UploadError> {
    let stream = futures::stream::once(async move { Ok::<_, io::Error>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);
    let mut flag = None;
    let mut type_hint = None;
    let mut files = Vec::new();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some("name") => flag = Some(field.text().await?),
            Some("type") => type_hint = Some(field.text().await?),
            Some("data") => {
                let file_name = field.file_name().unwrap_or("upload").to_string();
                let data = field.bytes().await?;
                files.push(UploadedFile {
                    file_name,
                    data: data.to_vec(),
                });
            }
            _ => {}
        }
    }
    Ok(UploadForm {
        flag: flag.ok_or(UploadError::MissingField("name"))?,
        flag_type: type_hint
            .ok_or(UploadError::MissingField("type"))?
            .parse()?,
        files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::commands::flag::FlagValue;

    const BOUNDARY: &str = "XyZzY";

    fn multipart_body(fields: &[(&str, Option<&str>, &str)]) -> Vec<u8> {
        let mut body = String::new();
        for (name, file_name, content) in fields {
            body.push_str(&format!("--{BOUNDARY}\r\n"));
            match file_name {
                Some(file_name) => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"; filename=\"{file_name}\"\r\nContent-Type: text/plain\r\n\r\n"
                )),
                None => body.push_str(&format!(
                    "Content-Disposition: form-data; name=\"{name}\"\r\n\r\n"
                )),
            }
            body.push_str(content);
            body.push_str("\r\n");
        }
        body.push_str(&format!("--{BOUNDARY}--\r\n"));
        body.into_bytes()
    }

    fn content_type() -> String {
        format!("multipart/form-data; boundary={BOUNDARY}")
    }

    #[test]
    fn test_parse_upload_form() {
        let body = multipart_body(&[
            ("name", None, "input"),
            ("type", None, "stringSlice"),
            ("data", Some("a.txt"), "first"),
            ("data", Some("b.txt"), "second"),
        ]);
        let form = parse_upload(&content_type(), body).unwrap();
        assert_eq!(form.flag, "input");
        assert_eq!(form.flag_type, FlagType::StringSlice);
        let names: Vec<_> = form.files.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, ["a.txt", "b.txt"]);
        assert_eq!(form.files[1].data, b"second");
    }

    #[test]
    fn test_parse_upload_missing_type() {
        let body = multipart_body(&[("name", None, "input"), ("data", Some("a.txt"), "x")]);
        assert!(matches!(
            parse_upload(&content_type(), body),
            Err(UploadError::MissingField("type"))
        ));
    }

    #[test]
    fn test_parse_upload_not_multipart() {
        assert!(matches!(
            parse_upload("application/json", Vec::new()),
            Err(UploadError::Form(_))
        ));
    }

    #[test]
    fn test_error_status() {
        let form = parse_upload("application/json", Vec::new()).unwrap_err();
        assert_eq!(form.status(false), 400);
        assert_eq!(form.status(true), 500);

        let io = UploadError::Io {
            path: PathBuf::from("/x"),
            source: io::Error::other("disk full"),
        };
        assert_eq!(io.status(false), 500);
        assert_eq!(io.status(true), 500);
    }

    #[test]
    fn test_list_upload_round_trips_in_order() {
        let store = UploadStore::temporary().unwrap();
        let form = UploadForm {
            flag: "inputs".to_string(),
            flag_type: FlagType::StringSlice,
            files: vec![
                UploadedFile {
                    file_name: "a.txt".to_string(),
                    data: b"alpha".to_vec(),
                },
                UploadedFile {
                    file_name: "b.txt".to_string(),
                    data: b"beta".to_vec(),
                },
            ],
        };
        let response = store.accept(&form).unwrap();
        let parsed = FlagValue::parse(FlagType::StringSlice, &response.path).unwrap();
        let paths = parsed.as_str_list().unwrap();
        assert_eq!(paths.len(), 2);
        assert!(paths[0].ends_with("-a.txt"));
        assert!(paths[1].ends_with("-b.txt"));
        assert_eq!(std::fs::read_to_string(&paths[0]).unwrap(), "alpha");
        assert_eq!(std::fs::read_to_string(&paths[1]).unwrap(), "beta");
    }

    #[test]
    fn test_scalar_upload_is_single_path() {
        let store = UploadStore::temporary().unwrap();
        let form = UploadForm {
            flag: "config".to_string(),
            flag_type: FlagType::String,
            files: vec![UploadedFile {
                file_name: "conf.toml".to_string(),
                data: b"x = 1".to_vec(),
            }],
        };
        let response = store.accept(&form).unwrap();
        let path = PathBuf::from(&response.path);
        assert!(path.starts_with(store.dir()));
        assert_eq!(std::fs::read_to_string(path).unwrap(), "x = 1");
    }

    #[test]
    fn test_same_name_uploads_do_not_collide() {
        let store = UploadStore::temporary().unwrap();
        let first = store.store("data.csv", &b"1"[..]).unwrap();
        let second = store.store("data.csv", &b"2"[..]).unwrap();
        assert_ne!(first, second);
    }

    #[test]
    fn test_empty_upload_is_rejected() {
        let store = UploadStore::temporary().unwrap();
        let form = UploadForm {
            flag: "config".to_string(),
            flag_type: FlagType::String,
            files: vec![],
        };
        assert!(matches!(
            store.accept(&form),
            Err(UploadError::NoFiles(_))
        ));
    }

    #[test]
    fn test_sanitize_file_name() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name("my report.pdf"), "my_report.pdf");
        assert_eq!(sanitize_file_name(".."), "upload");
    }

    #[test]
    fn test_in_dir_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let nested = dir.path().join("uploads/nested");
        let store = UploadStore::in_dir(&nested).unwrap();
        assert!(nested.is_dir());
        assert_eq!(store.dir(), nested);
    }
}
