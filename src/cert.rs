use std::path::{Path, PathBuf};

/// Where TLS material for the listener comes from.
///
/// `dns` and `http` certificates are issued by an external ACME client; the agent only
/// picks up what that client left under `{cert_dir}/certificates/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum CertMode {
    #[default]
    None,
    File,
    Dns,
    Http,
}

#[derive(Debug, Clone, Default)]
pub struct CertConfig {
    pub mode: CertMode,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub domain: String,
    pub cert_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

#[derive(Debug)]
pub enum CertError {
    Disabled,
    MissingPath { which: &'static str },
    MissingDomain,
    NotIssued { path: PathBuf },
}

impl std::fmt::Display for CertError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disabled => write!(f, "certificate mode is none"),
            Self::MissingPath { which } => write!(f, "cert mode file requires {which}"),
            Self::MissingDomain => write!(f, "cert mode requires a cert domain"),
            Self::NotIssued { path } => {
                write!(f, "certificate material not found: {}", path.display())
            }
        }
    }
}

impl std::error::Error for CertError {}

impl CertConfig {
    pub fn is_enabled(&self) -> bool {
        self.mode != CertMode::None
    }

    pub fn resolve(&self) -> Result<CertPaths, CertError> {
        match self.mode {
            CertMode::None => Err(CertError::Disabled),
            CertMode::File => {
                let cert_file = self
                    .cert_file
                    .clone()
                    .filter(|p| !p.as_os_str().is_empty())
                    .ok_or(CertError::MissingPath { which: "cert file" })?;
                let key_file = self
                    .key_file
                    .clone()
                    .filter(|p| !p.as_os_str().is_empty())
                    .ok_or(CertError::MissingPath { which: "key file" })?;
                Ok(CertPaths {
                    cert_file,
                    key_file,
                })
            }
            CertMode::Dns | CertMode::Http => {
                if self.domain.is_empty() {
                    return Err(CertError::MissingDomain);
                }
                let dir = self.cert_dir.join("certificates");
                let paths = CertPaths {
                    cert_file: dir.join(format!("{}.crt", self.domain)),
                    key_file: dir.join(format!("{}.key", self.domain)),
                };
                require_file(&paths.cert_file)?;
                require_file(&paths.key_file)?;
                Ok(paths)
            }
        }
    }
}

fn require_file(path: &Path) -> Result<(), CertError> {
    if path.is_file() {
        Ok(())
    } else {
        Err(CertError::NotIssued {
            path: path.to_path_buf(),
        })
    }
}
