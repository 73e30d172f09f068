//! Builds the collaborators for one environment.
//!
//! The runner calls the factory once per phase, on the blocking thread that
//! runs the phase, so the collaborators themselves never cross threads.

use opticon_core::{CatalogStore, YamlCatalog};
use opticon_sync::{
    DirectorySource, GitCli, MetadataSource, ReconcileContext, VersionControlAdapter,
};

use crate::error::RunnerError;

pub trait EnvironmentFactory: Send + Sync + 'static {
    fn source(&self, ctx: &ReconcileContext) -> Result<Box<dyn MetadataSource>, RunnerError>;

    fn vcs(&self, ctx: &ReconcileContext) -> Result<Box<dyn VersionControlAdapter>, RunnerError>;

    fn catalog(&self, ctx: &ReconcileContext) -> Result<Box<dyn CatalogStore>, RunnerError>;
}

/// Directory mirror + `git` working tree + YAML catalog, all from settings.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFactory;

impl EnvironmentFactory for DefaultFactory {
    fn source(&self, ctx: &ReconcileContext) -> Result<Box<dyn MetadataSource>, RunnerError> {
        let root = ctx
            .environment
            .source_path
            .clone()
            .ok_or_else(|| RunnerError::MissingSource {
                environment: ctx.name().clone(),
            })?;
        Ok(Box::new(DirectorySource::new(root)))
    }

    fn vcs(&self, ctx: &ReconcileContext) -> Result<Box<dyn VersionControlAdapter>, RunnerError> {
        let git = GitCli::init(ctx.working_tree_path(), ctx.settings.remote.clone())?;
        Ok(Box::new(git))
    }

    fn catalog(&self, ctx: &ReconcileContext) -> Result<Box<dyn CatalogStore>, RunnerError> {
        let catalog = YamlCatalog::open_at(&ctx.home, ctx.name().clone())?;
        Ok(Box::new(catalog))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use opticon_core::{EnvironmentName, EnvironmentSettings, Settings};
    use tempfile::TempDir;

    #[test]
    fn missing_source_path_is_reported() {
        let home = TempDir::new().expect("home");
        let settings = Settings {
            environments: vec![EnvironmentSettings::new("uat")],
            ..Settings::default()
        };
        let ctx = ReconcileContext::new(home.path(), settings, &EnvironmentName::from("uat"))
            .expect("context");
        match DefaultFactory.source(&ctx) {
            Err(RunnerError::MissingSource { environment }) => assert_eq!(environment.0, "uat"),
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("expected missing source"),
        }
    }

    #[test]
    fn catalog_opens_under_home() {
        let home = TempDir::new().expect("home");
        let settings = Settings {
            environments: vec![EnvironmentSettings::new("uat")],
            ..Settings::default()
        };
        let ctx = ReconcileContext::new(home.path(), settings, &EnvironmentName::from("uat"))
            .expect("context");
        let catalog = DefaultFactory.catalog(&ctx).expect("catalog");
        assert_eq!(catalog.environment().0, "uat");
        assert!(catalog.list_by_environment().expect("list").is_empty());
    }
}
