// Helper unit injection planning
//
// Helper classes shipped in the agent jar under one package prefix are
// defined in the host before any page loads. Within that set a class must be
// defined after its super class and the interfaces it implements.

use crate::bootstrap::SetupError;
use cfdebug_instrumenter::classfile::ClassFile;
use serde::Serialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::{Read, Seek};
use std::path::Path;
use tracing::debug;
use zip::ZipArchive;

pub const DEFAULT_HELPER_PREFIX: &str = "luceedebug/coreinject";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HelperUnit {
    /// Dotted name, as the host's define call expects it
    pub name: String,
    /// Super class and interfaces, internal names
    pub depends_on: Vec<String>,
    #[serde(skip)]
    pub bytes: Vec<u8>,
}

impl HelperUnit {
    pub fn from_class_bytes(bytes: Vec<u8>) -> Result<Self, SetupError> {
        let class = ClassFile::parse(&bytes).map_err(|source| SetupError::BadHelper {
            name: "<unknown>".to_string(),
            source,
        })?;
        let internal_name = class.this_class_name()?;
        let mut depends_on: Vec<String> = class.super_class_name()?.into_iter().collect();
        depends_on.extend(class.interface_names()?);

        Ok(Self {
            name: internal_name.replace('/', "."),
            depends_on,
            bytes,
        })
    }

    fn internal_name(&self) -> String {
        self.name.replace('.', "/")
    }
}

/// Every `<prefix>*.class` entry of the jar at `jar_path`, in archive order
pub fn read_helpers(jar_path: &Path, prefix: &str) -> Result<Vec<HelperUnit>, SetupError> {
    let file = File::open(jar_path).map_err(|source| SetupError::Io {
        path: jar_path.to_path_buf(),
        source,
    })?;
    let archive = ZipArchive::new(file).map_err(|source| SetupError::Jar {
        path: jar_path.to_path_buf(),
        source,
    })?;
    read_helpers_from(archive, prefix)
}

pub fn read_helpers_from<R: Read + Seek>(
    mut archive: ZipArchive<R>,
    prefix: &str,
) -> Result<Vec<HelperUnit>, SetupError> {
    let mut helpers = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i).map_err(|source| SetupError::Entry {
            entry: format!("#{}", i),
            source: source.into(),
        })?;
        let entry_name = entry.name().to_string();
        if entry.is_dir() || !entry_name.starts_with(prefix) || !entry_name.ends_with(".class") {
            continue;
        }

        let mut bytes = Vec::new();
        entry.read_to_end(&mut bytes).map_err(|source| SetupError::Entry {
            entry: entry_name.clone(),
            source,
        })?;

        let helper = HelperUnit::from_class_bytes(bytes).map_err(|e| match e {
            SetupError::BadHelper { source, .. } => SetupError::BadHelper {
                name: entry_name.clone(),
                source,
            },
            other => other,
        })?;
        debug!("Found helper {} ({} bytes)", helper.name, helper.bytes.len());
        helpers.push(helper);
    }
    Ok(helpers)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mark {
    Visiting,
    Done,
}

/// Order helpers so every unit follows the helpers it extends or implements;
/// unrelated units keep their encounter order
pub fn injection_order(helpers: Vec<HelperUnit>) -> Result<Vec<HelperUnit>, SetupError> {
    let index: HashMap<String, usize> = helpers
        .iter()
        .enumerate()
        .map(|(i, h)| (h.internal_name(), i))
        .collect();

    let mut marks: Vec<Option<Mark>> = vec![None; helpers.len()];
    let mut order = Vec::with_capacity(helpers.len());
    let mut path = Vec::new();
    for i in 0..helpers.len() {
        visit(i, &helpers, &index, &mut marks, &mut path, &mut order)?;
    }

    let mut slots: Vec<Option<HelperUnit>> = helpers.into_iter().map(Some).collect();
    Ok(order.into_iter().filter_map(|i| slots[i].take()).collect())
}

fn visit(
    i: usize,
    helpers: &[HelperUnit],
    index: &HashMap<String, usize>,
    marks: &mut [Option<Mark>],
    path: &mut Vec<String>,
    order: &mut Vec<usize>,
) -> Result<(), SetupError> {
    match marks[i] {
        Some(Mark::Done) => return Ok(()),
        Some(Mark::Visiting) => {
            path.push(helpers[i].name.clone());
            return Err(SetupError::DependencyCycle(path.clone()));
        }
        None => {}
    }

    marks[i] = Some(Mark::Visiting);
    path.push(helpers[i].name.clone());
    for dependency in &helpers[i].depends_on {
        if let Some(&j) = index.get(dependency) {
            visit(j, helpers, index, marks, path, order)?;
        }
    }
    path.pop();
    marks[i] = Some(Mark::Done);
    order.push(i);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{class_bytes, jar};

    fn helper(name: &str, super_name: &str, interfaces: &[&str]) -> HelperUnit {
        HelperUnit::from_class_bytes(class_bytes(name, super_name, interfaces, &[])).unwrap()
    }

    fn names(helpers: &[HelperUnit]) -> Vec<&str> {
        helpers.iter().map(|h| h.name.as_str()).collect()
    }

    #[test]
    fn test_unrelated_helpers_keep_order() {
        let ordered = injection_order(vec![
            helper("luceedebug/coreinject/B", "java/lang/Object", &[]),
            helper("luceedebug/coreinject/A", "java/lang/Object", &[]),
        ])
        .unwrap();
        assert_eq!(names(&ordered), vec!["luceedebug.coreinject.B", "luceedebug.coreinject.A"]);
    }

    #[test]
    fn test_parents_come_first() {
        let ordered = injection_order(vec![
            helper("luceedebug/coreinject/Child", "luceedebug/coreinject/Base", &["luceedebug/coreinject/Iface"]),
            helper("luceedebug/coreinject/Other", "java/lang/Object", &[]),
            helper("luceedebug/coreinject/Base", "java/lang/Object", &[]),
            helper("luceedebug/coreinject/Iface", "java/lang/Object", &[]),
        ])
        .unwrap();
        assert_eq!(
            names(&ordered),
            vec![
                "luceedebug.coreinject.Base",
                "luceedebug.coreinject.Iface",
                "luceedebug.coreinject.Child",
                "luceedebug.coreinject.Other",
            ]
        );
    }

    #[test]
    fn test_cycle_is_an_error() {
        let err = injection_order(vec![
            helper("luceedebug/coreinject/A", "luceedebug/coreinject/B", &[]),
            helper("luceedebug/coreinject/B", "luceedebug/coreinject/A", &[]),
        ])
        .unwrap_err();
        match err {
            SetupError::DependencyCycle(path) => assert_eq!(
                path,
                vec!["luceedebug.coreinject.A", "luceedebug.coreinject.B", "luceedebug.coreinject.A"]
            ),
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[test]
    fn test_read_helpers_from_jar() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.jar");
        jar(
            &path,
            &[
                ("META-INF/MANIFEST.MF", b"Manifest-Version: 1.0\n".to_vec()),
                ("luceedebug/Agent.class", class_bytes("luceedebug/Agent", "java/lang/Object", &[], &[])),
                (
                    "luceedebug/coreinject/DebugManager.class",
                    class_bytes("luceedebug/coreinject/DebugManager", "java/lang/Object", &[], &[]),
                ),
                ("luceedebug/coreinject/notes.txt", b"x".to_vec()),
            ],
        );

        let helpers = read_helpers(&path, DEFAULT_HELPER_PREFIX).unwrap();
        assert_eq!(names(&helpers), vec!["luceedebug.coreinject.DebugManager"]);
        assert_eq!(helpers[0].depends_on, vec!["java/lang/Object"]);
    }

    #[test]
    fn test_bad_helper_names_entry() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.jar");
        jar(&path, &[("luceedebug/coreinject/Broken.class", b"nope".to_vec())]);

        match read_helpers(&path, DEFAULT_HELPER_PREFIX).unwrap_err() {
            SetupError::BadHelper { name, .. } => {
                assert_eq!(name, "luceedebug/coreinject/Broken.class")
            }
            other => panic!("unexpected error {:?}", other),
        }
    }
}
