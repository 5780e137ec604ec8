//! Convention-based remote paths for one application on one server.

use crate::settings::Settings;

/// Directory holding the most recent synchronized, not-yet-live tree.
pub const STAGING_DIR: &str = "_staging";

/// Live directory name when environments do not get their own segment.
pub const CURRENT_DIR: &str = "current";

/// Remote paths and names derived from an application name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteLayout {
    root: String,
    unit_dir: String,
    name: String,
    environment: Option<String>,
}

impl RemoteLayout {
    /// Build the layout for `name`. `environment` only shapes paths when the
    /// settings ask for a per-environment segment.
    pub fn new(settings: &Settings, name: &str, environment: &str) -> Self {
        Self {
            root: settings.remote_root.trim_end_matches('/').to_string(),
            unit_dir: settings.unit_dir.trim_end_matches('/').to_string(),
            name: name.to_string(),
            environment: settings
                .environment_in_path
                .then(|| environment.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn environment(&self) -> Option<&str> {
        self.environment.as_deref()
    }

    /// `<root>/<name>`
    pub fn app_dir(&self) -> String {
        format!("{}/{}", self.root, self.name)
    }

    pub fn staging_dir(&self) -> String {
        format!("{}/{}", self.app_dir(), STAGING_DIR)
    }

    pub fn current_dir(&self) -> String {
        match &self.environment {
            Some(env) => format!("{}/{}", self.app_dir(), env),
            None => format!("{}/{}", self.app_dir(), CURRENT_DIR),
        }
    }

    /// Where the build leaves the executable inside the staging tree.
    pub fn staged_binary(&self) -> String {
        format!("{}/{}", self.staging_dir(), self.name)
    }

    /// The executable the supervisor runs.
    pub fn binary_path(&self) -> String {
        format!("{}/{}", self.current_dir(), self.name)
    }

    pub fn service_name(&self) -> String {
        match &self.environment {
            Some(env) => format!("{}-{}", self.name, env),
            None => self.name.clone(),
        }
    }

    pub fn unit_name(&self) -> String {
        format!("{}.service", self.service_name())
    }

    pub fn unit_path(&self) -> String {
        format!("{}/{}", self.unit_dir, self.unit_name())
    }
}
