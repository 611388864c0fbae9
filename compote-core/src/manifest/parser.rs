//! Compose file parser.
//!
//! Decodes compose YAML into the typed model and validates it.

use super::types::*;
use crate::error::{CompoteError, Result};
use crate::graph;
use std::path::Path;
use tracing::{info, instrument};

/// Parser for compose files.
pub struct ComposeParser;

impl ComposeParser {
    /// Parse a compose file from a string.
    ///
    /// # Errors
    ///
    /// Returns an error if the YAML is invalid, no services are defined, a
    /// service lacks both `image` and `build`, a dependency is missing or
    /// circular, or a config/secret reference does not resolve.
    #[instrument(skip(content))]
    pub fn parse(content: &str) -> Result<ComposeFile> {
        let compose: ComposeFile = serde_yaml::from_str(content)
            .map_err(|e| CompoteError::ManifestParse { reason: e.to_string() })?;

        Self::validate(&compose)?;

        Ok(compose)
    }

    /// Parse a compose file from a file path.
    #[instrument]
    pub fn parse_file<P: AsRef<Path> + std::fmt::Debug>(path: P) -> Result<ComposeFile> {
        let path = path.as_ref();
        info!("Reading compose file from {:?}", path);

        let content = std::fs::read_to_string(path).map_err(|e| CompoteError::FileRead {
            path: path.to_string_lossy().to_string(),
            source: e,
        })?;

        Self::parse(&content)
    }

    /// Validate a typed compose document.
    ///
    /// Also used by callers that obtain the typed model without going through
    /// the YAML decoder.
    pub fn validate(compose: &ComposeFile) -> Result<()> {
        if compose.services.is_empty() {
            return Err(CompoteError::NoServices);
        }

        for (name, service) in &compose.services {
            if service.image.is_none() && service.build.is_none() {
                return Err(CompoteError::ManifestParse {
                    reason: format!(
                        "service '{}' must have either 'image' or 'build' specified",
                        name
                    ),
                });
            }

            for dep in service.dependencies() {
                if !compose.services.contains_key(dep) {
                    return Err(CompoteError::MissingDependency {
                        service: name.clone(),
                        dependency: dep.to_string(),
                    });
                }
            }

            Self::validate_file_objects(compose, name, service)?;
        }

        graph::ensure_acyclic(compose)?;

        Ok(())
    }

    /// Check that every config/secret reference resolves to a file-backed
    /// top-level definition. External definitions fail fast.
    fn validate_file_objects(compose: &ComposeFile, name: &str, service: &Service) -> Result<()> {
        for reference in &service.configs {
            let source = reference.source();
            let def = compose.configs.get(source).ok_or_else(|| {
                CompoteError::UnresolvedReference {
                    service: name.to_string(),
                    kind: "config",
                    reference: source.to_string(),
                }
            })?;
            if def.external.is_external() {
                return Err(CompoteError::ExternalNotSupported {
                    kind: "config",
                    name: source.to_string(),
                });
            }
        }

        for reference in &service.secrets {
            let source = reference.source();
            let def = compose.secrets.get(source).ok_or_else(|| {
                CompoteError::UnresolvedReference {
                    service: name.to_string(),
                    kind: "secret",
                    reference: source.to_string(),
                }
            })?;
            if def.external.is_external() {
                return Err(CompoteError::ExternalNotSupported {
                    kind: "secret",
                    name: source.to_string(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_basic_file() {
        let yaml = r#"
            services:
              web:
                image: nginx:latest
                ports: ["8080:80"]
                depends_on: [db]
              db:
                image: postgres:16
        "#;
        let compose = ComposeParser::parse(yaml).unwrap();
        assert_eq!(compose.services.len(), 2);
        assert_eq!(compose.services["web"].ports, vec!["8080:80"]);
    }

    #[test]
    fn test_empty_services_rejected() {
        let err = ComposeParser::parse("services: {}").unwrap_err();
        assert!(matches!(err, CompoteError::NoServices));
    }

    #[test]
    fn test_service_without_image_or_build_rejected() {
        let yaml = r#"
            services:
              web:
                hostname: web
        "#;
        let err = ComposeParser::parse(yaml).unwrap_err();
        assert!(matches!(err, CompoteError::ManifestParse { .. }));
    }

    #[test]
    fn test_build_only_service_accepted() {
        let yaml = r#"
            services:
              app:
                build: ./app
        "#;
        let compose = ComposeParser::parse(yaml).unwrap();
        assert_eq!(compose.services["app"].build.as_ref().unwrap().context(), "./app");
    }

    #[test]
    fn test_missing_dependency_rejected() {
        let yaml = r#"
            services:
              web:
                image: nginx
                depends_on: [ghost]
        "#;
        let err = ComposeParser::parse(yaml).unwrap_err();
        match err {
            CompoteError::MissingDependency { service, dependency } => {
                assert_eq!(service, "web");
                assert_eq!(dependency, "ghost");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_self_dependency_is_a_cycle() {
        let yaml = r#"
            services:
              web:
                image: nginx
                depends_on: [web]
        "#;
        let err = ComposeParser::parse(yaml).unwrap_err();
        assert!(matches!(err, CompoteError::CircularDependency { .. }));
    }

    #[test]
    fn test_unresolved_config_rejected() {
        let yaml = r#"
            services:
              web:
                image: nginx
                configs: [missing]
        "#;
        let err = ComposeParser::parse(yaml).unwrap_err();
        assert!(matches!(err, CompoteError::UnresolvedReference { kind: "config", .. }));
    }

    #[test]
    fn test_external_secret_rejected() {
        let yaml = r#"
            services:
              web:
                image: nginx
                secrets: [token]
            secrets:
              token:
                external: true
        "#;
        let err = ComposeParser::parse(yaml).unwrap_err();
        assert!(matches!(err, CompoteError::ExternalNotSupported { kind: "secret", .. }));
    }
}
