//! The bootstrap helper: seed, open and reset one local database file.
//!
//! A [`DataAccessHelper`] is an immutable value holding the logical database
//! name and the resolved path of the live file. Construction does no I/O;
//! every operation touches the file system synchronously on the caller's
//! thread. The helper adds no locking of its own, see
//! [`SharedDataAccessHelper`](crate::SharedDataAccessHelper) for that.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::config::{HelperConfig, Template, TemplateSource};
use crate::error::{BootstrapError, BootstrapResult};
use crate::sqlite::{ClearSummary, DatabaseEngine, DatabaseHandle, SqliteEngine};

/// What [`DataAccessHelper::try_create_and_validate_database`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// The template was copied into place.
    Copied,
    /// A valid database already existed and was left untouched.
    AlreadyPresent,
}

#[derive(Debug, Clone)]
pub struct DataAccessHelper<E = SqliteEngine> {
    name: String,
    path: PathBuf,
    template: TemplateSource,
    engine: E,
}

impl DataAccessHelper<SqliteEngine> {
    /// Helper for `name` in `<platform data dir>/<app_id>`, seeded from a
    /// template next to the running executable.
    pub fn new(app_id: impl Into<String>, name: impl Into<String>) -> BootstrapResult<Self> {
        Self::from_config(HelperConfig::new(name).with_app_id(app_id))
    }

    pub fn from_config(config: HelperConfig) -> BootstrapResult<Self> {
        Self::with_engine(config, SqliteEngine)
    }
}

impl<E: DatabaseEngine> DataAccessHelper<E> {
    pub fn with_engine(config: HelperConfig, engine: E) -> BootstrapResult<Self> {
        let path = config.resolve_database_path()?;
        Ok(Self {
            name: config.database_name,
            path,
            template: config.template,
            engine,
        })
    }

    pub fn database_name(&self) -> &str {
        &self.name
    }

    /// Absolute path of the live database file.
    pub fn database_path(&self) -> &Path {
        &self.path
    }

    /// Make sure a valid database exists at [`database_path`](Self::database_path),
    /// copying the template if there is no file yet. An existing file is never
    /// modified.
    pub fn try_create_and_validate_database(&self) -> BootstrapResult<BootstrapOutcome> {
        if self.path.exists() {
            self.engine.validate(&self.path)?;
            debug!(path = %self.path.display(), "database already present");
            return Ok(BootstrapOutcome::AlreadyPresent);
        }

        if self.copy_template()? {
            info!(path = %self.path.display(), "copied template database");
            Ok(BootstrapOutcome::Copied)
        } else {
            // Another caller put a file in place between our check and persist.
            self.engine.validate(&self.path)?;
            Ok(BootstrapOutcome::AlreadyPresent)
        }
    }

    /// Boolean form of [`try_create_and_validate_database`](Self::try_create_and_validate_database).
    /// Failures are logged and reported as `false`.
    pub fn create_and_validate_database(&self) -> bool {
        match self.try_create_and_validate_database() {
            Ok(_) => true,
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "database bootstrap failed");
                false
            }
        }
    }

    /// Open a new handle to the live database. Never creates the file.
    pub fn open_application_database(&self) -> BootstrapResult<E::Handle> {
        self.engine.open(&self.path)
    }

    /// Delete every row from every user table, keeping the schema.
    ///
    /// Destructive and irreversible. Unlike a fire-and-forget reset this
    /// reports what was cleared, and any failure comes back as
    /// [`BootstrapError::DeleteFailure`] after being logged.
    pub fn delete_all_data(&self) -> BootstrapResult<ClearSummary> {
        let result = self.engine.open(&self.path).and_then(|mut handle| {
            let summary = handle.clear_all_rows()?;
            handle.close()?;
            Ok(summary)
        });

        match result {
            Ok(summary) => {
                info!(
                    path = %self.path.display(),
                    tables = summary.tables.len(),
                    rows = summary.rows_deleted,
                    "deleted all data"
                );
                Ok(summary)
            }
            Err(err) => {
                warn!(path = %self.path.display(), error = %err, "failed to delete data");
                Err(BootstrapError::DeleteFailure {
                    path: self.path.clone(),
                    reason: err.to_string(),
                })
            }
        }
    }

    /// Stage the template next to the live path, validate it, then move it
    /// into place without clobbering. Returns `false` if a file appeared at
    /// the live path in the meantime. Nothing is left behind on failure.
    fn copy_template(&self) -> BootstrapResult<bool> {
        let template = self.template.locate(&self.name)?;
        if let Template::Path(src) = &template {
            if !src.is_file() {
                return Err(BootstrapError::MissingTemplateResource { path: src.clone() });
            }
        }

        let copy_failure = |source: io::Error| BootstrapError::CopyFailure {
            path: self.path.clone(),
            source,
        };

        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(dir).map_err(copy_failure)?;

        let mut staged = tempfile::Builder::new()
            .prefix(".")
            .suffix(".bootstrap")
            .tempfile_in(dir)
            .map_err(copy_failure)?;
        match &template {
            Template::Path(src) => {
                let mut input = File::open(src).map_err(copy_failure)?;
                io::copy(&mut input, staged.as_file_mut()).map_err(copy_failure)?;
            }
            Template::Bytes(bytes) => staged.as_file_mut().write_all(bytes).map_err(copy_failure)?,
        }
        staged.as_file().sync_all().map_err(copy_failure)?;

        self.engine
            .validate(staged.path())
            .map_err(|err| match err {
                BootstrapError::InvalidDatabaseFile { reason, .. } => {
                    BootstrapError::InvalidDatabaseFile {
                        path: self.path.clone(),
                        reason: format!("template rejected: {reason}"),
                    }
                }
                other => other,
            })?;

        match staged.persist_noclobber(&self.path) {
            Ok(_) => Ok(true),
            Err(err) if err.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(copy_failure(err.error)),
        }
    }
}
