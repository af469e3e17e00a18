// Offline instrumentation
//
// Runs every class of a directory tree or jar through the load hook, writes
// the resulting tree and reports per-unit outcomes. Units are transformed in
// parallel on tokio's blocking pool.

use anyhow::{Context, Result};
use cfdebug_instrumenter::{LoadHook, Outcome, Unchanged};
use serde::Serialize;
use std::fs::{self, File};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use zip::ZipArchive;

/// A class read from the input, keyed by its internal name
#[derive(Debug)]
pub struct InputUnit {
    pub name: String,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UnitStatus {
    Rewritten { entry_points: Vec<String> },
    Unchanged { reason: Unchanged },
    Exempt,
    Failed { error: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct UnitResult {
    pub name: String,
    #[serde(flatten)]
    pub status: UnitStatus,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct InstrumentReport {
    pub total: usize,
    pub rewritten: usize,
    pub unchanged: usize,
    pub failed: usize,
    pub units: Vec<UnitResult>,
}

impl InstrumentReport {
    fn record(&mut self, result: UnitResult) {
        self.total += 1;
        match result.status {
            UnitStatus::Rewritten { .. } => self.rewritten += 1,
            UnitStatus::Unchanged { .. } | UnitStatus::Exempt => self.unchanged += 1,
            UnitStatus::Failed { .. } => self.failed += 1,
        }
        self.units.push(result);
    }
}

/// Class files under a directory or inside a jar, sorted by name
pub fn collect_units(input: &Path) -> Result<Vec<InputUnit>> {
    let mut units = if input.is_dir() {
        let mut units = Vec::new();
        walk_classes(input, input, &mut units)?;
        units
    } else {
        read_jar_classes(input)?
    };
    units.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(units)
}

fn walk_classes(dir: &Path, base: &Path, out: &mut Vec<InputUnit>) -> Result<()> {
    for entry in fs::read_dir(dir).with_context(|| format!("Failed to read {}", dir.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            walk_classes(&path, base, out)?;
        } else if path.extension().is_some_and(|ext| ext == "class") {
            let relative = path.strip_prefix(base)?.with_extension("");
            let name = relative.to_string_lossy().replace('\\', "/");
            let bytes = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
            out.push(InputUnit { name, bytes });
        }
    }
    Ok(())
}

fn read_jar_classes(jar: &Path) -> Result<Vec<InputUnit>> {
    let file = File::open(jar).with_context(|| format!("Failed to open {}", jar.display()))?;
    let mut archive =
        ZipArchive::new(file).with_context(|| format!("Failed to read {} as a jar", jar.display()))?;

    let mut units = Vec::new();
    for i in 0..archive.len() {
        let mut entry = archive.by_index(i)?;
        if entry.is_dir() || !entry.name().ends_with(".class") {
            continue;
        }
        // absolute names and `..` components would escape the output tree
        let Some(relative) = entry.enclosed_name().map(Path::to_path_buf) else {
            warn!("Skipping jar entry {} outside the archive root", entry.name());
            continue;
        };
        let name = relative.with_extension("").to_string_lossy().replace('\\', "/");
        let mut bytes = Vec::new();
        entry
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to read {}.class from {}", name, jar.display()))?;
        units.push(InputUnit { name, bytes });
    }
    Ok(units)
}

/// Transform every unit from `input`, writing each class (rewritten or not)
/// under `output`
pub async fn instrument(input: &Path, output: &Path, hook: Arc<LoadHook>) -> Result<InstrumentReport> {
    let units = collect_units(input)?;
    info!("Instrumenting {} classes from {}", units.len(), input.display());
    fs::create_dir_all(output).with_context(|| format!("Failed to create {}", output.display()))?;

    let mut tasks = Vec::with_capacity(units.len());
    for unit in units {
        let hook = Arc::clone(&hook);
        let target = output.join(format!("{}.class", unit.name));
        tasks.push(tokio::task::spawn_blocking(move || process_unit(&hook, unit, &target)));
    }

    let mut report = InstrumentReport::default();
    for task in tasks {
        report.record(task.await??);
    }

    info!(
        "Done: {} rewritten, {} unchanged, {} failed",
        report.rewritten, report.unchanged, report.failed
    );
    Ok(report)
}

fn process_unit(hook: &LoadHook, unit: InputUnit, target: &Path) -> Result<UnitResult> {
    let (status, bytes) = match hook.transform(&unit.name, &unit.bytes) {
        Ok(None) => (UnitStatus::Exempt, unit.bytes),
        Ok(Some(transformed)) => match transformed.outcome {
            Outcome::Rewritten(report) => (
                UnitStatus::Rewritten {
                    entry_points: report
                        .instrumented
                        .iter()
                        .map(|m| format!("{}{}", m.method.name, m.method.descriptor))
                        .collect(),
                },
                transformed.unit.bytes,
            ),
            Outcome::Unchanged(reason) => (UnitStatus::Unchanged { reason }, unit.bytes),
        },
        Err(e) => {
            warn!("{}: {}", unit.name, e);
            (UnitStatus::Failed { error: e.to_string() }, unit.bytes)
        }
    };

    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent).with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    fs::write(target, &bytes).with_context(|| format!("Failed to write {}", target.display()))?;
    debug!("Wrote {}", target.display());

    Ok(UnitResult {
        name: unit.name,
        status,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{class_bytes, jar};
    use cfdebug_instrumenter::classfile::ClassFile;
    use cfdebug_instrumenter::InstrumentConfig;

    const PAGE: &str = "lucee/runtime/PageImpl";

    fn hook() -> Arc<LoadHook> {
        Arc::new(LoadHook::new(InstrumentConfig::default()).unwrap())
    }

    fn method_names(bytes: &[u8]) -> Vec<String> {
        let class = ClassFile::parse(bytes).unwrap();
        class.methods.iter().map(|m| class.member_name(m).unwrap()).collect()
    }

    #[tokio::test]
    async fn test_instrument_directory() {
        let input = tempfile::tempdir().unwrap();
        let output = tempfile::tempdir().unwrap();
        fs::create_dir_all(input.path().join("app/sub")).unwrap();
        fs::write(input.path().join("app/index_cfm$cf.class"), class_bytes("app/index_cfm$cf", PAGE, &[], &["call", "helper"])).unwrap();
        fs::write(input.path().join("app/sub/Util.class"), class_bytes("app/sub/Util", "java/lang/Object", &[], &["call"])).unwrap();
        fs::write(input.path().join("app/Broken.class"), b"broken").unwrap();
        fs::write(input.path().join("app/readme.txt"), b"skip me").unwrap();

        let report = instrument(input.path(), output.path(), hook()).await.unwrap();

        assert_eq!(report.total, 3);
        assert_eq!(report.rewritten, 1);
        assert_eq!(report.unchanged, 1);
        assert_eq!(report.failed, 1);

        let names: Vec<_> = report.units.iter().map(|u| u.name.as_str()).collect();
        assert_eq!(names, vec!["app/Broken", "app/index_cfm$cf", "app/sub/Util"]);
        assert_eq!(
            report.units[1].status,
            UnitStatus::Rewritten {
                entry_points: vec!["call(Llucee/runtime/PageContext;)Ljava/lang/Object;".to_string()]
            }
        );
        assert_eq!(report.units[2].status, UnitStatus::Unchanged { reason: Unchanged::NotAPage });

        let page = fs::read(output.path().join("app/index_cfm$cf.class")).unwrap();
        assert_eq!(method_names(&page), vec!["call", "__luceedebug__call", "helper"]);
        let util = fs::read(output.path().join("app/sub/Util.class")).unwrap();
        assert_eq!(util, fs::read(input.path().join("app/sub/Util.class")).unwrap());
        assert!(!output.path().join("app/readme.txt").exists());
    }

    #[tokio::test]
    async fn test_instrument_jar() {
        let dir = tempfile::tempdir().unwrap();
        let jar_path = dir.path().join("pages.jar");
        jar(
            &jar_path,
            &[
                ("app/a_cfm$cf.class", class_bytes("app/a_cfm$cf", PAGE, &[], &["call", "udfCall1"])),
                ("lucee/runtime/Thing.class", class_bytes("lucee/runtime/Thing", PAGE, &[], &["call"])),
            ],
        );
        let output = dir.path().join("out");

        let report = instrument(&jar_path, &output, hook()).await.unwrap();

        assert_eq!(report.rewritten, 1);
        assert_eq!(report.units[1].status, UnitStatus::Exempt);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["units"][0]["status"], "rewritten");
        assert_eq!(json["units"][1]["status"], "exempt");
        assert!(output.join("lucee/runtime/Thing.class").exists());
    }

    #[tokio::test]
    async fn test_jar_entries_cannot_escape_output() {
        let dir = tempfile::tempdir().unwrap();
        let jar_path = dir.path().join("pages.jar");
        jar(
            &jar_path,
            &[
                ("../../../escaped.class", class_bytes("escaped", PAGE, &[], &["call"])),
                ("/abs/rooted.class", class_bytes("abs/rooted", PAGE, &[], &["call"])),
                ("app/a_cfm$cf.class", class_bytes("app/a_cfm$cf", PAGE, &[], &["call"])),
            ],
        );
        let output = dir.path().join("out/a/b");

        let report = instrument(&jar_path, &output, hook()).await.unwrap();

        assert_eq!(report.total, 1);
        assert_eq!(report.units[0].name, "app/a_cfm$cf");
        assert!(output.join("app/a_cfm$cf.class").exists());
        assert!(!dir.path().join("escaped.class").exists());
        assert!(!dir.path().join("out/escaped.class").exists());
        assert!(!Path::new("/abs/rooted.class").exists());
    }
}
