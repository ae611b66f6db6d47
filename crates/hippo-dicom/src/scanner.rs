//! 实例存储扫描
//!
//! 接收端把每个检查写入根目录下的一个子目录。扫描器按目录汇总文件数量和
//! 最近修改时间，在一个静默期内没有变化的目录被视为已接收完毕。

use crate::parser::{DicomParser, ParsedInstance};
use hippo_core::{HippoError, Result, Series, Study, StudyHeader};
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};
use tracing::{debug, info, warn};

/// 目录内容的指纹：文件数量与最近修改时间
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StudyFingerprint {
    pub file_count: usize,
    pub latest_modification: SystemTime,
}

/// 检查目录的完整性判断
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completeness {
    /// 仍在接收中，距最近一次修改的时间
    Arriving { quiet_for: Duration },
    /// 已超过静默期
    Quiet,
}

/// 实例存储中的一个检查目录
#[derive(Debug, Clone)]
pub struct StudyDirectory {
    pub path: PathBuf,
    pub name: String,
    pub fingerprint: StudyFingerprint,
    pub completeness: Completeness,
}

impl StudyDirectory {
    pub fn is_quiet(&self) -> bool {
        self.completeness == Completeness::Quiet
    }
}

/// 实例存储扫描器
#[derive(Debug, Clone)]
pub struct InstanceStoreScanner {
    root: PathBuf,
    quiet_period: Duration,
    parser: std::sync::Arc<DicomParser>,
}

impl InstanceStoreScanner {
    pub fn new(root: impl Into<PathBuf>, quiet_period: Duration) -> Self {
        Self {
            root: root.into(),
            quiet_period,
            parser: std::sync::Arc::new(DicomParser::new()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// 列出根目录下所有非空的检查目录
    pub fn survey(&self, now: SystemTime) -> Result<Vec<StudyDirectory>> {
        let entries = fs::read_dir(&self.root).map_err(|e| {
            HippoError::Config(format!("无法读取实例存储目录 {:?}: {}", self.root, e))
        })?;

        let mut directories = Vec::new();
        for entry in entries {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() || is_hidden(&path) {
                continue;
            }

            let files = collect_files(&path)?;
            if files.is_empty() {
                debug!("跳过空目录: {:?}", path);
                continue;
            }

            let latest_modification = files
                .iter()
                .filter_map(|f| fs::metadata(f).and_then(|m| m.modified()).ok())
                .max()
                .unwrap_or(SystemTime::UNIX_EPOCH);
            let quiet_for = now
                .duration_since(latest_modification)
                .unwrap_or(Duration::ZERO);
            let completeness = if quiet_for >= self.quiet_period {
                Completeness::Quiet
            } else {
                Completeness::Arriving { quiet_for }
            };

            directories.push(StudyDirectory {
                name: entry.file_name().to_string_lossy().into_owned(),
                path,
                fingerprint: StudyFingerprint {
                    file_count: files.len(),
                    latest_modification,
                },
                completeness,
            });
        }

        directories.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(directories)
    }

    /// 解析目录中的全部实例并按检查、序列分组
    ///
    /// 无法解析的文件被记录并跳过；没有任何有效实例时返回
    /// `IncompleteStudy`。一个目录中出现多个 Study Instance UID 时，
    /// 每个检查单独返回。
    pub fn load_study(&self, directory: &Path) -> Result<Vec<Study>> {
        let files = collect_files(directory)?;
        info!("加载检查目录 {:?}: {} 个文件", directory, files.len());

        let mut skipped = 0usize;
        let mut studies: BTreeMap<String, (StudyHeader, BTreeMap<String, Series>)> =
            BTreeMap::new();

        for file in &files {
            let ParsedInstance {
                study,
                series,
                instance,
            } = match self.parser.parse_file(file) {
                Ok(parsed) => parsed,
                Err(e) => {
                    warn!("跳过无法解析的文件 {:?}: {}", file, e);
                    skipped += 1;
                    continue;
                }
            };

            let (_, series_map) = studies
                .entry(study.study_uid.clone())
                .or_insert_with(|| (study, BTreeMap::new()));
            let entry = series_map
                .entry(series.series_uid.clone())
                .or_insert_with(|| Series::new(series));

            if entry
                .instances
                .iter()
                .any(|i| i.sop_instance_uid == instance.sop_instance_uid)
            {
                warn!(
                    "重复的 SOP Instance UID {}，忽略 {:?}",
                    instance.sop_instance_uid, file
                );
                skipped += 1;
                continue;
            }
            entry.instances.push(instance);
        }

        if studies.is_empty() {
            return Err(HippoError::IncompleteStudy(format!(
                "{:?} 中没有可解析的DICOM实例（跳过 {} 个文件）",
                directory, skipped
            )));
        }

        if studies.len() > 1 {
            warn!(
                "目录 {:?} 包含 {} 个检查，分别处理",
                directory,
                studies.len()
            );
        }

        Ok(studies
            .into_values()
            .map(|(header, series_map)| {
                let mut series: Vec<Series> = series_map.into_values().collect();
                series.sort_by(|a, b| {
                    a.info
                        .series_number
                        .cmp(&b.info.series_number)
                        .then_with(|| a.info.series_uid.cmp(&b.info.series_uid))
                });
                Study {
                    header,
                    series,
                    source_dir: directory.to_path_buf(),
                    skipped_files: skipped,
                }
            })
            .collect())
    }
}

fn is_hidden(path: &Path) -> bool {
    path.file_name()
        .map(|n| n.to_string_lossy().starts_with('.'))
        .unwrap_or(false)
}

/// 递归收集目录下的常规文件（忽略隐藏文件），按路径排序
fn collect_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];

    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let path = entry?.path();
            if is_hidden(&path) {
                continue;
            }
            if path.is_dir() {
                pending.push(path);
            } else if path.is_file() {
                files.push(path);
            }
        }
    }

    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{write_series, SyntheticSlice};

    #[test]
    fn test_survey_quiet_and_arriving() {
        let root = tempfile::tempdir().unwrap();
        write_series(&root.path().join("study_a"), "1.2.3", "1.2.3.1", 2, 1.0).unwrap();
        fs::create_dir(root.path().join("empty")).unwrap();
        fs::create_dir(root.path().join(".partial")).unwrap();

        let scanner = InstanceStoreScanner::new(root.path(), Duration::from_secs(30));

        let now = SystemTime::now();
        let dirs = scanner.survey(now).unwrap();
        assert_eq!(dirs.len(), 1);
        assert_eq!(dirs[0].name, "study_a");
        assert_eq!(dirs[0].fingerprint.file_count, 2);
        assert!(!dirs[0].is_quiet());

        let later = now + Duration::from_secs(60);
        assert!(scanner.survey(later).unwrap()[0].is_quiet());
    }

    #[test]
    fn test_load_study_groups_and_skips() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("study");
        write_series(&dir, "1.2.3", "1.2.3.1", 3, 1.0).unwrap();
        SyntheticSlice::new("1.2.3", "1.2.3.2", 0, 0.0)
            .with_description("T1 localizer")
            .write_to(&dir.join("other.dcm"))
            .unwrap();
        fs::write(dir.join("README.txt"), "not dicom").unwrap();

        let scanner = InstanceStoreScanner::new(root.path(), Duration::ZERO);
        let studies = scanner.load_study(&dir).unwrap();
        assert_eq!(studies.len(), 1);

        let study = &studies[0];
        assert_eq!(study.study_uid(), "1.2.3");
        assert_eq!(study.series.len(), 2);
        assert_eq!(study.instance_count(), 4);
        assert_eq!(study.skipped_files, 1);
    }

    #[test]
    fn test_load_study_skips_nan_position() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("study");
        write_series(&dir, "1.2.3", "1.2.3.1", 3, 5.0).unwrap();
        SyntheticSlice::new("1.2.3", "1.2.3.1", 3, f64::NAN)
            .write_to(&dir.join("nan.dcm"))
            .unwrap();

        let scanner = InstanceStoreScanner::new(root.path(), Duration::ZERO);
        let studies = scanner.load_study(&dir).unwrap();
        assert_eq!(studies[0].instance_count(), 3);
        assert_eq!(studies[0].skipped_files, 1);
        assert!(studies[0].series[0]
            .instances
            .iter()
            .all(|i| i.geometry.image_position.iter().all(|v| v.is_finite())));
    }

    #[test]
    fn test_skipped_files_counted_per_directory() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("mixed");
        write_series(&dir, "1.2.3", "1.2.3.1", 2, 1.0).unwrap();
        write_series(&dir, "1.2.4", "1.2.4.1", 2, 1.0).unwrap();
        fs::write(dir.join("broken.dcm"), [0u8; 16]).unwrap();

        let scanner = InstanceStoreScanner::new(root.path(), Duration::ZERO);
        let studies = scanner.load_study(&dir).unwrap();
        assert_eq!(studies.len(), 2);
        assert!(studies.iter().all(|s| s.skipped_files == 1));
    }

    #[test]
    fn test_load_study_without_valid_instances() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("junk");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("a.bin"), [0u8; 16]).unwrap();

        let scanner = InstanceStoreScanner::new(root.path(), Duration::ZERO);
        let err = scanner.load_study(&dir).unwrap_err();
        assert!(matches!(err, HippoError::IncompleteStudy(_)));
    }
}
