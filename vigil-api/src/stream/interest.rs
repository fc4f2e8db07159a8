//! Subject interest set of a stream session.

use vigil_core::subject::{
    job_grade_subject, job_subject, mailbox_subject, user_info_subject, user_subject,
    SYSTEM_SUBJECT,
};
use vigil_core::UserInfo;

/// Subjects a session listens to, derived from the user's identity, job,
/// grade and mailbox access.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterestSet {
    subjects: Vec<String>,
}

impl InterestSet {
    /// Every grade from 0 up to the user's own grade is included, so a
    /// higher rank also receives what is addressed to lower ranks.
    pub fn build(info: &UserInfo, mailboxes: &[u64]) -> Self {
        let mut subjects = vec![
            user_subject(info.user_id),
            user_info_subject(info.user_id),
            job_subject(&info.job),
        ];
        subjects.extend((0..=info.job_grade).map(|grade| job_grade_subject(&info.job, grade)));
        subjects.push(SYSTEM_SUBJECT.to_string());
        subjects.extend(mailboxes.iter().map(|id| mailbox_subject(*id)));
        subjects.dedup();

        Self { subjects }
    }

    pub fn subjects(&self) -> &[String] {
        &self.subjects
    }

    pub fn contains(&self, subject: &str) -> bool {
        self.subjects.iter().any(|s| s == subject)
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(job: &str, grade: i32) -> UserInfo {
        UserInfo {
            account_id: 1,
            user_id: 5,
            enabled: true,
            license: "license:1".to_string(),
            group: "user".to_string(),
            last_char_id: Some(5),
            job: job.to_string(),
            job_grade: grade,
            can_be_superuser: false,
            superuser: false,
            override_job: None,
            override_job_grade: None,
        }
    }

    #[test]
    fn test_scenario_interest_set() {
        let set = InterestSet::build(&info("police", 2), &[7]);
        let expected = [
            "notifications.user.5",
            "userinfo.user.5",
            "notifications.job.police",
            "notifications.jobgrade.police.0",
            "notifications.jobgrade.police.1",
            "notifications.jobgrade.police.2",
            "notifications.system",
            "notifications.mailbox.7",
        ];
        assert_eq!(set.len(), expected.len());
        for subject in expected {
            assert!(set.contains(subject), "missing {}", subject);
        }
        assert!(!set.contains("notifications.jobgrade.police.3"));
    }

    #[test]
    fn test_negative_grade_has_no_grade_subjects() {
        let set = InterestSet::build(&info("unemployed", -1), &[]);
        assert!(!set.subjects().iter().any(|s| s.contains("jobgrade")));
        assert_eq!(set.len(), 4);
    }
}
