//! 序列选择
//!
//! 按声明式规则从检查中挑出唯一一个要测量的序列。

use hippo_core::{HippoError, Result, Series, Study};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// 序列选择规则，所有给出的条件都必须满足
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectionRule {
    /// 模态，不区分大小写
    pub modality: Option<String>,
    /// 序列描述包含的子串，不区分大小写
    pub description_contains: Option<String>,
    /// 序列描述需匹配的正则表达式
    pub description_regex: Option<String>,
    /// 最少实例数
    pub min_instances: Option<usize>,
}

impl Default for SelectionRule {
    fn default() -> Self {
        Self {
            modality: Some("MR".to_string()),
            description_contains: Some("HCropVolume".to_string()),
            description_regex: None,
            min_instances: None,
        }
    }
}

/// 编译后的选择器
#[derive(Debug, Clone)]
pub struct SeriesSelector {
    rule: SelectionRule,
    regex: Option<Regex>,
}

impl SeriesSelector {
    pub fn new(rule: SelectionRule) -> Result<Self> {
        let regex = rule
            .description_regex
            .as_deref()
            .map(|pattern| {
                RegexBuilder::new(pattern)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| {
                        HippoError::Config(format!("序列描述正则无效 '{}': {}", pattern, e))
                    })
            })
            .transpose()?;

        Ok(Self { rule, regex })
    }

    pub fn rule(&self) -> &SelectionRule {
        &self.rule
    }

    /// 单个序列是否满足规则
    pub fn matches(&self, series: &Series) -> bool {
        let description = series.info.description.as_deref().unwrap_or("");

        if let Some(modality) = &self.rule.modality {
            if !series.info.modality.eq_ignore_ascii_case(modality) {
                return false;
            }
        }

        if let Some(needle) = &self.rule.description_contains {
            if !description.to_lowercase().contains(&needle.to_lowercase()) {
                return false;
            }
        }

        if let Some(regex) = &self.regex {
            if !regex.is_match(description) {
                return false;
            }
        }

        if let Some(min) = self.rule.min_instances {
            if series.instances.len() < min {
                return false;
            }
        }

        true
    }

    /// 选出唯一匹配的序列；没有或多于一个匹配时失败并列出所有候选序列
    pub fn select<'a>(&self, study: &'a Study) -> Result<&'a Series> {
        let matched: Vec<&Series> = study.series.iter().filter(|s| self.matches(s)).collect();

        for series in &study.series {
            debug!("候选序列: {}", series.describe());
        }

        match matched.as_slice() {
            [series] => {
                info!(
                    "检查 {} 选中序列 {}",
                    study.study_uid(),
                    series.describe()
                );
                Ok(*series)
            }
            [] => Err(self.failure(study, "没有序列满足选择规则")),
            many => Err(self.failure(
                study,
                &format!("{} 个序列满足选择规则，无法确定唯一序列", many.len()),
            )),
        }
    }

    fn failure(&self, study: &Study, reason: &str) -> HippoError {
        HippoError::Selection {
            reason: format!("{}: {}", study.study_uid(), reason),
            candidates: study.series.iter().map(Series::describe).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hippo_core::{SeriesInfo, StudyHeader};
    use std::path::PathBuf;

    fn series(uid: &str, modality: &str, description: &str) -> Series {
        Series::new(SeriesInfo {
            series_uid: uid.to_string(),
            modality: modality.to_string(),
            description: Some(description.to_string()),
            series_number: None,
        })
    }

    fn study(series: Vec<Series>) -> Study {
        Study {
            header: StudyHeader {
                study_uid: "1.2.3".into(),
                ..Default::default()
            },
            series,
            source_dir: PathBuf::from("/tmp/study"),
            skipped_files: 0,
        }
    }

    #[test]
    fn test_select_single_match() {
        let selector = SeriesSelector::new(SelectionRule::default()).unwrap();
        let study = study(vec![
            series("1.1", "MR", "T1 localizer"),
            series("1.2", "mr", "hcropvolume left"),
        ]);
        assert_eq!(selector.select(&study).unwrap().info.series_uid, "1.2");
    }

    #[test]
    fn test_two_matches_fail_with_candidates() {
        let selector = SeriesSelector::new(SelectionRule::default()).unwrap();
        let study = study(vec![
            series("1.1", "MR", "HCropVolume"),
            series("1.2", "MR", "HCropVolume repeat"),
            series("1.3", "CT", "HCropVolume"),
        ]);
        match selector.select(&study).unwrap_err() {
            HippoError::Selection { candidates, .. } => {
                assert_eq!(candidates.len(), 3);
                assert!(candidates[0].contains("1.1"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_no_match() {
        let selector = SeriesSelector::new(SelectionRule::default()).unwrap();
        let study = study(vec![series("1.1", "MR", "T2 axial")]);
        assert!(matches!(
            selector.select(&study),
            Err(HippoError::Selection { .. })
        ));
    }

    #[test]
    fn test_regex_and_min_instances() {
        let rule = SelectionRule {
            modality: None,
            description_contains: None,
            description_regex: Some("^hcrop".into()),
            min_instances: Some(1),
        };
        let selector = SeriesSelector::new(rule).unwrap();
        let s = series("1.1", "MR", "HCropVolume");
        // 没有实例，不满足最少实例数
        assert!(!selector.matches(&s));
    }

    #[test]
    fn test_invalid_regex() {
        let rule = SelectionRule {
            description_regex: Some("(".into()),
            ..Default::default()
        };
        assert!(matches!(
            SeriesSelector::new(rule),
            Err(HippoError::Config(_))
        ));
    }
}
