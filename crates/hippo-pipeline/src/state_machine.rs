//! 检查状态机
//!
//! 管理每个检查目录从接收到报告的处理状态，保证内容未变化且已处理过的检查
//! 不会在每个扫描周期被重复处理，而收到新实例的检查会重新处理。

use hippo_core::{HippoError, Result};
use hippo_dicom::{StudyDirectory, StudyFingerprint};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tracing::debug;

/// 检查处理状态
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StudyState {
    /// 仍在接收实例
    Arriving,
    /// 静默期已过，等待处理
    Ready,
    Processing,
    Reported,
    Failed,
}

/// 检查状态转换事件
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum StudyEvent {
    /// 目录指纹发生变化
    InstancesChanged,
    QuietPeriodElapsed,
    ProcessingStarted,
    ReportSubmitted,
    ProcessingFailed,
    /// 瞬时错误，下一个周期再处理
    Deferred,
}

/// 检查状态机
#[derive(Debug)]
pub struct StudyStateMachine {
    transitions: HashMap<(StudyState, StudyEvent), StudyState>,
}

impl StudyStateMachine {
    /// 创建新的状态机实例
    pub fn new() -> Self {
        use StudyEvent::*;
        use StudyState::*;

        let mut transitions = HashMap::new();

        // 定义状态转换规则
        transitions.insert((Arriving, InstancesChanged), Arriving);
        transitions.insert((Arriving, QuietPeriodElapsed), Ready);
        transitions.insert((Ready, InstancesChanged), Arriving);
        transitions.insert((Ready, ProcessingStarted), Processing);
        transitions.insert((Processing, ReportSubmitted), Reported);
        transitions.insert((Processing, ProcessingFailed), Failed);
        transitions.insert((Processing, Deferred), Arriving);
        transitions.insert((Reported, InstancesChanged), Arriving);
        transitions.insert((Failed, InstancesChanged), Arriving);

        Self { transitions }
    }

    /// 检查状态转换是否有效
    pub fn can_transition(&self, from: StudyState, event: StudyEvent) -> bool {
        self.transitions.contains_key(&(from, event))
    }

    /// 执行状态转换
    pub fn transition(&self, from: StudyState, event: StudyEvent) -> Result<StudyState> {
        self.transitions.get(&(from, event)).copied().ok_or_else(|| {
            HippoError::Internal(format!("无效的状态转换: {:?} --{:?}-->", from, event))
        })
    }

    /// 获取状态的所有可能事件
    pub fn get_possible_events(&self, current_state: StudyState) -> Vec<StudyEvent> {
        self.transitions
            .keys()
            .filter(|(state, _)| *state == current_state)
            .map(|(_, event)| *event)
            .collect()
    }
}

impl Default for StudyStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy)]
struct TrackedStudy {
    state: StudyState,
    fingerprint: StudyFingerprint,
}

/// 按检查目录记录状态和指纹
#[derive(Debug, Default)]
pub struct StudyTracker {
    machine: StudyStateMachine,
    studies: HashMap<PathBuf, TrackedStudy>,
}

impl StudyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 根据最新扫描结果更新状态，返回该检查是否可以处理
    pub fn observe(&mut self, directory: &StudyDirectory) -> Result<bool> {
        let machine = &self.machine;
        let tracked = self
            .studies
            .entry(directory.path.clone())
            .or_insert(TrackedStudy {
                state: StudyState::Arriving,
                fingerprint: directory.fingerprint,
            });

        if tracked.fingerprint != directory.fingerprint {
            debug!("检查目录内容变化: {:?}", directory.path);
            tracked.state = machine.transition(tracked.state, StudyEvent::InstancesChanged)?;
            tracked.fingerprint = directory.fingerprint;
        }

        if tracked.state == StudyState::Arriving && directory.is_quiet() {
            tracked.state = machine.transition(tracked.state, StudyEvent::QuietPeriodElapsed)?;
        }

        Ok(tracked.state == StudyState::Ready)
    }

    /// 对已跟踪的检查应用事件
    pub fn apply(&mut self, path: &Path, event: StudyEvent) -> Result<StudyState> {
        let tracked = self
            .studies
            .get_mut(path)
            .ok_or_else(|| HippoError::Internal(format!("未跟踪的检查目录: {:?}", path)))?;
        tracked.state = self.machine.transition(tracked.state, event)?;
        Ok(tracked.state)
    }

    pub fn state(&self, path: &Path) -> Option<StudyState> {
        self.studies.get(path).map(|t| t.state)
    }

    /// 丢弃已不存在的目录
    pub fn retain_present(&mut self, present: &HashSet<PathBuf>) {
        self.studies.retain(|path, _| present.contains(path));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hippo_dicom::Completeness;
    use std::time::{Duration, SystemTime};

    fn directory(count: usize, quiet: bool) -> StudyDirectory {
        StudyDirectory {
            path: PathBuf::from("/store/study"),
            name: "study".into(),
            fingerprint: StudyFingerprint {
                file_count: count,
                latest_modification: SystemTime::UNIX_EPOCH + Duration::from_secs(count as u64),
            },
            completeness: if quiet {
                Completeness::Quiet
            } else {
                Completeness::Arriving {
                    quiet_for: Duration::ZERO,
                }
            },
        }
    }

    #[test]
    fn test_valid_transitions() {
        let sm = StudyStateMachine::new();

        assert!(sm.can_transition(StudyState::Arriving, StudyEvent::QuietPeriodElapsed));
        assert!(sm.can_transition(StudyState::Ready, StudyEvent::ProcessingStarted));
        assert!(sm.can_transition(StudyState::Reported, StudyEvent::InstancesChanged));
    }

    #[test]
    fn test_invalid_transitions() {
        let sm = StudyStateMachine::new();

        assert!(!sm.can_transition(StudyState::Reported, StudyEvent::ProcessingStarted));
        assert!(sm
            .transition(StudyState::Arriving, StudyEvent::ReportSubmitted)
            .is_err());
        assert_eq!(sm.get_possible_events(StudyState::Processing).len(), 3);
    }

    #[test]
    fn test_tracker_processes_once() {
        let mut tracker = StudyTracker::new();
        let path = PathBuf::from("/store/study");

        assert!(!tracker.observe(&directory(2, false)).unwrap());
        assert!(tracker.observe(&directory(2, true)).unwrap());

        tracker.apply(&path, StudyEvent::ProcessingStarted).unwrap();
        tracker.apply(&path, StudyEvent::ReportSubmitted).unwrap();

        // 内容未变化，不再处理
        assert!(!tracker.observe(&directory(2, true)).unwrap());
        assert_eq!(tracker.state(&path), Some(StudyState::Reported));

        // 收到新实例后重新处理
        assert!(tracker.observe(&directory(3, true)).unwrap());
    }

    #[test]
    fn test_deferred_study_retried() {
        let mut tracker = StudyTracker::new();
        let path = PathBuf::from("/store/study");
        assert!(tracker.observe(&directory(1, true)).unwrap());
        tracker.apply(&path, StudyEvent::ProcessingStarted).unwrap();
        assert_eq!(
            tracker.apply(&path, StudyEvent::Deferred).unwrap(),
            StudyState::Arriving
        );
        assert!(tracker.observe(&directory(1, true)).unwrap());
    }
}
