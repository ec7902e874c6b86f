//! Helper configuration: database name, data directory and template source.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{BootstrapError, BootstrapResult};

/// Where the read-only template database comes from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateSource {
    /// `<directory of the running executable>/<database name>`.
    #[default]
    ExecutableDir,
    /// `<dir>/<database name>`.
    Directory(PathBuf),
    /// An explicit template file.
    File(PathBuf),
    /// Template bytes compiled into the binary, see [`TemplateSource::embedded`].
    #[serde(skip)]
    Embedded(EmbeddedTemplate),
}

/// Template bytes baked into the binary, usually via `include_bytes!`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EmbeddedTemplate(&'static [u8]);

impl EmbeddedTemplate {
    pub fn bytes(&self) -> &'static [u8] {
        self.0
    }
}

/// A located template, ready to be copied.
#[derive(Debug)]
pub(crate) enum Template {
    Path(PathBuf),
    Bytes(&'static [u8]),
}

impl TemplateSource {
    pub fn embedded(bytes: &'static [u8]) -> Self {
        Self::Embedded(EmbeddedTemplate(bytes))
    }

    /// Resolve the template for `name`. Performs no existence check.
    pub(crate) fn locate(&self, name: &str) -> BootstrapResult<Template> {
        match self {
            Self::ExecutableDir => {
                let dir = std::env::current_exe()
                    .ok()
                    .and_then(|exe| exe.parent().map(Path::to_path_buf))
                    .ok_or_else(|| BootstrapError::MissingTemplateResource {
                        path: PathBuf::from(name),
                    })?;
                Ok(Template::Path(dir.join(name)))
            }
            Self::Directory(dir) => Ok(Template::Path(dir.join(name))),
            Self::File(path) => Ok(Template::Path(path.clone())),
            Self::Embedded(embedded) => Ok(Template::Bytes(embedded.bytes())),
        }
    }
}

/// Configuration for a [`DataAccessHelper`](crate::DataAccessHelper).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HelperConfig {
    /// Logical database file name, e.g. `contacts.db`.
    pub database_name: String,
    /// Application identifier, e.g. `com.example.contacts`. Names the
    /// per-application directory under the platform data directory.
    #[serde(default)]
    pub app_id: Option<String>,
    /// Writable directory holding the live database. Overrides
    /// `<platform data dir>/<app_id>`.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub template: TemplateSource,
}

impl HelperConfig {
    pub fn new(database_name: impl Into<String>) -> Self {
        Self {
            database_name: database_name.into(),
            app_id: None,
            data_dir: None,
            template: TemplateSource::default(),
        }
    }

    pub fn with_app_id(mut self, app_id: impl Into<String>) -> Self {
        self.app_id = Some(app_id.into());
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    pub fn with_template(mut self, template: TemplateSource) -> Self {
        self.template = template;
        self
    }

    /// Validate the name and compute the absolute path of the live database.
    pub fn resolve_database_path(&self) -> BootstrapResult<PathBuf> {
        validate_database_name(&self.database_name)?;
        if let Some(dir) = &self.data_dir {
            return Ok(dir.join(&self.database_name));
        }

        let app_id = self.app_id.as_deref().ok_or(BootstrapError::MissingAppId)?;
        validate_database_name(app_id)?;
        let base = dirs::data_dir().ok_or(BootstrapError::NoDataDirectory)?;
        Ok(base.join(app_id).join(&self.database_name))
    }
}

/// Accept only a single, plain file name. Also applied to application ids.
pub fn validate_database_name(name: &str) -> BootstrapResult<()> {
    let invalid = |reason: &'static str| -> BootstrapResult<()> {
        Err(BootstrapError::InvalidName {
            name: name.to_string(),
            reason,
        })
    };

    if name.is_empty() {
        return invalid("name is empty");
    }
    if name.contains('\0') {
        return invalid("name contains a NUL byte");
    }
    if name.contains(&['/', '\\'][..]) {
        return invalid("name contains a path separator");
    }
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        _ => invalid("name must be a plain file name"),
    }
}
