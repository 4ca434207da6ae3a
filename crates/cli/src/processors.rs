//! Built-in processors for deployments laid out on disk.
//!
//! Only exploded content is inspected. An archive file still becomes a
//! sub-deployment but contributes no descriptors.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use deploy_core::{Attachable, AttachmentKey, DeploymentUnit, ListKey, Phase};
use deployer::keys::{
    DEPLOYMENT_CONTENTS, EXCLUDED_DEPENDENCIES, EXCLUDED_SUBSYSTEMS, REGISTERED_SUBSYSTEMS,
    RESOLVED_DEPENDENCIES, SUB_DEPLOYMENTS,
};
use deployer::{
    DeployerChains, DeploymentPhaseContext, DeploymentUnitProcessingError,
    DeploymentUnitProcessor,
};
use serde::Deserialize;
use tracing::{debug, info};

const STRUCTURE_DESCRIPTOR: &str = "META-INF/deployment-structure.toml";
const MANIFEST_FILE: &str = "META-INF/MANIFEST.MF";
const SUB_DEPLOYMENT_SUFFIXES: [&str; 3] = [".war", ".jar", ".rar"];

/// Main section of the unit's `META-INF/MANIFEST.MF`.
pub static MANIFEST: AttachmentKey<Manifest> = AttachmentKey::new("manifest");

/// Resolved module dependencies that survived the unit's exclusions.
pub static MODULE_DEPENDENCIES: ListKey<String> = ListKey::new("module-dependencies");

/// The chains `deployctl` runs every deployment through.
pub fn builtin_chains() -> DeployerChains {
    let mut builder = DeployerChains::builder();
    builder
        .add_core(Phase::Structure, 0x0100, StructureDescriptorProcessor)
        .add("ee", Phase::Structure, 0x0200, EarStructureProcessor)
        .add_core(Phase::Parse, 0x0100, ManifestProcessor)
        .add("modules", Phase::Dependencies, 0x0100, ManifestDependenciesProcessor)
        .add_core(Phase::Install, 0x1000, InstallSummaryProcessor);
    builder.build()
}

/// Manifest attributes, keys matched case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    attributes: BTreeMap<String, String>,
}

impl Manifest {
    /// Parse the main section. Lines starting with a space continue the
    /// previous value; the first blank line after an attribute ends the
    /// section.
    pub fn parse(content: &str) -> Self {
        let mut attributes: BTreeMap<String, String> = BTreeMap::new();
        let mut last: Option<String> = None;

        for line in content.lines() {
            if let Some(continuation) = line.strip_prefix(' ') {
                if let Some(value) = last.as_ref().and_then(|key| attributes.get_mut(key)) {
                    value.push_str(continuation);
                }
                continue;
            }
            if line.trim().is_empty() {
                if last.is_some() {
                    break;
                }
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim().to_ascii_lowercase();
                attributes.insert(key.clone(), value.trim_start().to_string());
                last = Some(key);
            }
        }

        Self { attributes }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.attributes
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    /// Module names from the `Dependencies` header, without their options.
    pub fn dependencies(&self) -> Vec<String> {
        self.get("Dependencies")
            .map(|header| {
                header
                    .split(',')
                    .filter_map(|entry| entry.split_whitespace().next())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.attributes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.attributes.is_empty()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct StructureDescriptor {
    excluded_subsystems: Vec<String>,
    excluded_dependencies: Vec<String>,
}

fn contents_dir(unit: &DeploymentUnit) -> Option<std::path::PathBuf> {
    unit.get_attachment(&DEPLOYMENT_CONTENTS)
        .map(|path| (*path).clone())
        .filter(|path| path.is_dir())
}

fn read_descriptor(path: &Path) -> Result<Option<String>, DeploymentUnitProcessingError> {
    if !path.is_file() {
        return Ok(None);
    }
    fs::read_to_string(path).map(Some).map_err(|e| {
        DeploymentUnitProcessingError::with_source(
            format!("cannot read {}", path.display()),
            e,
        )
    })
}

fn extend_set(
    unit: &DeploymentUnit,
    key: &AttachmentKey<BTreeSet<String>>,
    values: Vec<String>,
) {
    if values.is_empty() {
        return;
    }
    let mut set = unit
        .get_attachment(key)
        .map(|set| (*set).clone())
        .unwrap_or_default();
    set.extend(values);
    unit.put_attachment(key, set);
}

/// Merges `META-INF/deployment-structure.toml` exclusions into the unit.
struct StructureDescriptorProcessor;

impl DeploymentUnitProcessor for StructureDescriptorProcessor {
    fn deploy(&self, ctx: &DeploymentPhaseContext) -> Result<(), DeploymentUnitProcessingError> {
        let unit = ctx.deployment_unit();
        let Some(dir) = contents_dir(unit) else {
            return Ok(());
        };
        let path = dir.join(STRUCTURE_DESCRIPTOR);
        let Some(content) = read_descriptor(&path)? else {
            return Ok(());
        };

        let descriptor: StructureDescriptor = toml::from_str(&content).map_err(|e| {
            DeploymentUnitProcessingError::with_source(
                format!("malformed {}", path.display()),
                e,
            )
        })?;
        debug!(
            unit = %unit,
            excluded_subsystems = descriptor.excluded_subsystems.len(),
            excluded_dependencies = descriptor.excluded_dependencies.len(),
            "Applying structure descriptor"
        );
        extend_set(unit, &EXCLUDED_SUBSYSTEMS, descriptor.excluded_subsystems);
        extend_set(unit, &EXCLUDED_DEPENDENCIES, descriptor.excluded_dependencies);
        Ok(())
    }
}

/// Turns the `*.war`, `*.jar` and `*.rar` entries of an exploded `.ear`
/// into sub-deployments.
struct EarStructureProcessor;

impl DeploymentUnitProcessor for EarStructureProcessor {
    fn deploy(&self, ctx: &DeploymentPhaseContext) -> Result<(), DeploymentUnitProcessingError> {
        let unit = ctx.deployment_unit();
        if !unit.is_root() || !unit.name().ends_with(".ear") {
            return Ok(());
        }
        let Some(dir) = contents_dir(unit) else {
            return Ok(());
        };

        let entries = fs::read_dir(&dir).map_err(|e| {
            DeploymentUnitProcessingError::with_source(
                format!("cannot list {}", dir.display()),
                e,
            )
        })?;
        let mut names: Vec<String> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| entry.file_name().into_string().ok())
            .filter(|name| SUB_DEPLOYMENT_SUFFIXES.iter().any(|s| name.ends_with(s)))
            .collect();
        names.sort();

        for name in &names {
            ctx.deploy_sub_deployment(name).map_err(|e| {
                DeploymentUnitProcessingError::with_source(
                    format!("cannot deploy {}", name),
                    e,
                )
            })?;
        }
        debug!(unit = %unit, sub_deployments = names.len(), "Structure discovered");
        Ok(())
    }
}

struct ManifestProcessor;

impl DeploymentUnitProcessor for ManifestProcessor {
    fn deploy(&self, ctx: &DeploymentPhaseContext) -> Result<(), DeploymentUnitProcessingError> {
        let unit = ctx.deployment_unit();
        let Some(dir) = contents_dir(unit) else {
            return Ok(());
        };
        if let Some(content) = read_descriptor(&dir.join(MANIFEST_FILE))? {
            let manifest = Manifest::parse(&content);
            debug!(unit = %unit, attributes = manifest.len(), "Manifest parsed");
            unit.put_attachment(&MANIFEST, manifest);
        }
        Ok(())
    }

    fn undo(&self, unit: &DeploymentUnit) {
        unit.remove_attachment(&MANIFEST);
    }
}

/// Resolves the manifest `Dependencies` header. Every listed module is
/// recorded as resolved; only the ones the unit (or its parent) does not
/// exclude become module dependencies.
struct ManifestDependenciesProcessor;

impl DeploymentUnitProcessor for ManifestDependenciesProcessor {
    fn deploy(&self, ctx: &DeploymentPhaseContext) -> Result<(), DeploymentUnitProcessingError> {
        let unit = ctx.deployment_unit();
        let Some(manifest) = unit.get_attachment(&MANIFEST) else {
            return Ok(());
        };

        let mut excluded: BTreeSet<String> = unit
            .get_attachment(&EXCLUDED_DEPENDENCIES)
            .map(|set| (*set).clone())
            .unwrap_or_default();
        if let Some(parent) = unit.parent() {
            if let Some(set) = parent.get_attachment(&EXCLUDED_DEPENDENCIES) {
                excluded.extend(set.iter().cloned());
            }
        }

        for dependency in manifest.dependencies() {
            unit.add_to_attachment_list(&RESOLVED_DEPENDENCIES, dependency.clone());
            if excluded.contains(&dependency) {
                debug!(unit = %unit, dependency = %dependency, "Dependency excluded");
                continue;
            }
            unit.add_to_attachment_list(&MODULE_DEPENDENCIES, dependency);
        }
        Ok(())
    }

    fn undo(&self, unit: &DeploymentUnit) {
        unit.attachments().remove_list(&MODULE_DEPENDENCIES);
        unit.attachments().remove_list(&RESOLVED_DEPENDENCIES);
    }
}

struct InstallSummaryProcessor;

impl DeploymentUnitProcessor for InstallSummaryProcessor {
    fn deploy(&self, ctx: &DeploymentPhaseContext) -> Result<(), DeploymentUnitProcessingError> {
        let unit = ctx.deployment_unit();
        let subsystems = unit
            .get_attachment(&REGISTERED_SUBSYSTEMS)
            .map(|set| set.iter().cloned().collect::<Vec<_>>().join(","))
            .unwrap_or_default();
        info!(
            unit = %unit,
            sub_deployments = unit.get_attachment_list(&SUB_DEPLOYMENTS).len(),
            dependencies = unit.get_attachment_list(&MODULE_DEPENDENCIES).len(),
            subsystems = %subsystems,
            "Installed"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deployer::{Deployer, DeployerConfig, DeploymentSpec, DeploymentStatus};
    use tempfile::TempDir;

    fn write(root: &Path, relative: &str, content: &str) {
        let path = root.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, content).unwrap();
    }

    fn new_deployer() -> Deployer {
        let config = DeployerConfig {
            stability_timeout_ms: 5_000,
            ..DeployerConfig::default()
        };
        Deployer::new(builtin_chains(), config).unwrap()
    }

    fn sub_deployment(parent: &DeploymentUnit, name: &str) -> DeploymentUnit {
        parent
            .get_attachment_list(&SUB_DEPLOYMENTS)
            .into_iter()
            .find(|unit| unit.name() == name)
            .unwrap()
    }

    #[test]
    fn test_manifest_parse() {
        let manifest = Manifest::parse(
            "Manifest-Version: 1.0\r\n\
             Dependencies: org.slf4j, org.apache.commons.lang\r\n  export, com.h2\r\n\
             Created-By: hand\r\n\
             \r\n\
             Name: ignored/Entry.class\r\n\
             Sealed: true\r\n",
        );

        assert_eq!(manifest.get("manifest-version"), Some("1.0"));
        assert_eq!(manifest.get("CREATED-BY"), Some("hand"));
        assert_eq!(manifest.get("Sealed"), None);
        assert_eq!(manifest.len(), 3);
        assert_eq!(
            manifest.dependencies(),
            vec!["org.slf4j", "org.apache.commons.lang", "com.h2"]
        );
    }

    #[test]
    fn test_manifest_without_dependencies() {
        let manifest = Manifest::parse("\n\nManifest-Version: 1.0\n");
        assert_eq!(manifest.get("Manifest-Version"), Some("1.0"));
        assert!(manifest.dependencies().is_empty());
        assert!(Manifest::parse("").is_empty());
    }

    #[test]
    fn test_manifest_leading_continuation_is_dropped() {
        let manifest = Manifest::parse(" orphan\nDependencies: org.a,\n org.b\n");
        assert_eq!(manifest.len(), 1);
        assert_eq!(manifest.get("dependencies"), Some("org.a,org.b"));
        assert_eq!(manifest.dependencies(), vec!["org.a", "org.b"]);
    }

    #[test]
    fn test_builtin_chains() {
        let chains = builtin_chains();
        let structure: Vec<_> = chains
            .chain(Phase::Structure)
            .iter()
            .map(|p| p.processor_name())
            .collect();
        assert_eq!(
            structure,
            vec!["StructureDescriptorProcessor", "EarStructureProcessor"]
        );
        assert!(chains.chain(Phase::Cleanup).is_empty());
        assert_eq!(
            chains.subsystems().into_iter().collect::<Vec<_>>(),
            vec!["ee", "modules"]
        );
    }

    #[tokio::test]
    async fn test_exploded_ear_deploys_sub_deployments() {
        let temp = TempDir::new().unwrap();
        let ear = temp.path().join("shop.ear");
        write(
            &ear,
            STRUCTURE_DESCRIPTOR,
            "excluded_dependencies = [\"org.legacy\"]\n",
        );
        write(
            &ear,
            "web.war/META-INF/MANIFEST.MF",
            "Manifest-Version: 1.0\nDependencies: org.slf4j, org.legacy export\n",
        );
        write(&ear, "lib.jar", "not really a jar");
        write(&ear, "README.txt", "ignored");

        let deployer = new_deployer();
        deployer.deploy(DeploymentSpec::from_path(&ear).unwrap()).unwrap();
        deployer.await_stability().await.unwrap();

        assert_eq!(deployer.status("shop.ear"), DeploymentStatus::Ok);
        let unit = deployer.unit("shop.ear").unwrap();
        let mut names: Vec<String> = unit
            .get_attachment_list(&SUB_DEPLOYMENTS)
            .iter()
            .map(|u| u.name().to_string())
            .collect();
        names.sort();
        assert_eq!(names, vec!["lib.jar", "web.war"]);

        let web = sub_deployment(&unit, "web.war");
        assert!(web.has_attachment(&MANIFEST));
        assert_eq!(
            web.get_attachment_list(&RESOLVED_DEPENDENCIES),
            vec!["org.slf4j", "org.legacy"]
        );
        assert_eq!(web.get_attachment_list(&MODULE_DEPENDENCIES), vec!["org.slf4j"]);

        let lib = sub_deployment(&unit, "lib.jar");
        assert!(!lib.has_attachment(&MANIFEST));

        deployer.undeploy("shop.ear").unwrap();
        deployer.await_stability().await.unwrap();
        assert_eq!(deployer.status("shop.ear"), DeploymentStatus::Stopped);
        assert!(!web.has_attachment(&MANIFEST));
    }

    #[tokio::test]
    async fn test_structure_descriptor_excludes_ear_subsystem() {
        let temp = TempDir::new().unwrap();
        let ear = temp.path().join("flat.ear");
        write(&ear, STRUCTURE_DESCRIPTOR, "excluded_subsystems = [\"ee\"]\n");
        write(&ear, "web.war/index.html", "<html/>");

        let deployer = new_deployer();
        deployer.deploy(DeploymentSpec::from_path(&ear).unwrap()).unwrap();
        deployer.await_stability().await.unwrap();

        assert_eq!(deployer.status("flat.ear"), DeploymentStatus::Ok);
        let unit = deployer.unit("flat.ear").unwrap();
        assert!(unit.get_attachment_list(&SUB_DEPLOYMENTS).is_empty());
    }

    #[tokio::test]
    async fn test_malformed_structure_descriptor_fails_structure() {
        let temp = TempDir::new().unwrap();
        let war = temp.path().join("broken.war");
        write(&war, STRUCTURE_DESCRIPTOR, "excluded_subsystems = 3\n");

        let deployer = new_deployer();
        deployer.deploy(DeploymentSpec::from_path(&war).unwrap()).unwrap();
        deployer.await_stability().await.unwrap();

        let failure = deployer.status("broken.war").failure().cloned().unwrap();
        assert_eq!(failure.phase, Some(Phase::Structure));
        assert_eq!(
            failure.processor.as_deref(),
            Some("StructureDescriptorProcessor")
        );
        assert!(failure.reason.contains("malformed"));
    }
}
