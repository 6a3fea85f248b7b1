//! Pod and event lookups shared by the alert composer and the reaper.

use std::cmp::Ordering;

use jobmon_core::{ContainerTermination, EventType, JobSnapshot, ObjectStore, PodSnapshot, Selector};

use crate::ReconcileError;

/// Label selector matching the pods a job created.
pub fn controller_selector(job: &JobSnapshot, label: &str) -> Result<Selector, ReconcileError> {
    match job.controller_entry(label) {
        Some((key, id)) => Ok(Selector::new(key, id)),
        None => Err(ReconcileError::Configuration(format!(
            "job {} has no {} in its selector",
            job.key(),
            label
        ))),
    }
}

pub async fn job_pods(store: &dyn ObjectStore, job: &JobSnapshot, label: &str) -> Result<Vec<PodSnapshot>, ReconcileError> {
    let selector = controller_selector(job, label)?;
    Ok(store.list_pods(&job.namespace, &selector).await?)
}

/// Earliest-created pod. Ties go to the lexically smaller name; pods without a
/// creation timestamp sort last.
pub fn oldest_pod(pods: &[PodSnapshot]) -> Option<&PodSnapshot> {
    pods.iter().min_by(|a, b| {
        let by_time = match (a.created, b.created) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_time.then_with(|| a.name.cmp(&b.name))
    })
}

/// Warning events about `pod`, rendered `reason - message` one per line in listing order.
pub async fn warning_events(store: &dyn ObjectStore, pod: &PodSnapshot) -> Result<String, ReconcileError> {
    let events = store.list_events(&pod.namespace, &Selector::involved_object(&pod.name)).await?;
    let lines: Vec<String> = events
        .iter()
        .filter(|e| e.kind == EventType::Warning)
        .map(|e| format!("{} - {}", e.reason, e.message))
        .collect();
    Ok(lines.join("\n"))
}

/// First terminated container state in status order.
pub fn termination_state(pod: &PodSnapshot) -> Option<&ContainerTermination> {
    pod.containers.iter().find_map(|c| c.terminated.as_ref())
}

/// `reason - message` for a failed pod.
pub fn pod_status(pod: &PodSnapshot) -> Option<String> {
    if !pod.is_failed() {
        return None;
    }
    Some(format!(
        "{} - {}",
        pod.reason.as_deref().unwrap_or(""),
        pod.message.as_deref().unwrap_or("")
    ))
}

pub fn failed_pods(pods: &[PodSnapshot]) -> usize {
    pods.iter().filter(|p| p.is_failed()).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{pod, InMemoryStore};
    use chrono::{Duration, TimeZone, Utc};
    use jobmon_core::{ContainerStatus, EventRecord};

    fn at(min: i64) -> chrono::DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(min)
    }

    #[test]
    fn oldest_pod_picks_minimum_timestamp() {
        let pods = vec![pod("p-2", Some(at(2))), pod("p-1", Some(at(1))), pod("p-3", Some(at(3)))];
        assert_eq!(oldest_pod(&pods).map(|p| p.name.as_str()), Some("p-1"));
    }

    #[test]
    fn oldest_pod_breaks_ties_by_name_and_puts_missing_last() {
        let pods = vec![pod("zeta", Some(at(1))), pod("alpha", None), pod("beta", Some(at(1)))];
        assert_eq!(oldest_pod(&pods).map(|p| p.name.as_str()), Some("beta"));
        assert!(oldest_pod(&[]).is_none());
    }

    #[test]
    fn termination_state_takes_first_terminated_container() {
        let mut p = pod("p", None);
        let term = |code| ContainerTermination {
            exit_code: code,
            reason: None,
            message: None,
            signal: None,
            started_at: None,
            finished_at: None,
        };
        p.containers.push(ContainerStatus { name: "init".into(), terminated: None });
        p.containers.push(ContainerStatus { name: "sidecar".into(), terminated: Some(term(2)) });
        p.containers.push(ContainerStatus { name: "main".into(), terminated: Some(term(1)) });
        assert_eq!(termination_state(&p).map(|t| t.exit_code), Some(2));
        assert!(termination_state(&pod("q", None)).is_none());
    }

    #[test]
    fn pod_status_only_for_failed_pods() {
        let mut p = pod("p", None);
        p.phase = "Running".into();
        assert!(pod_status(&p).is_none());
        p.phase = "Failed".into();
        p.reason = Some("Evicted".into());
        p.message = Some("low memory".into());
        assert_eq!(pod_status(&p).as_deref(), Some("Evicted - low memory"));
        assert_eq!(failed_pods(&[p.clone(), pod("ok", None)]), 1);
    }

    #[test]
    fn missing_controller_label_is_configuration_error() {
        let job = JobSnapshot { namespace: "ns".into(), name: "j".into(), ..Default::default() };
        assert!(matches!(controller_selector(&job, "controller-uid"), Err(ReconcileError::Configuration(_))));
    }

    #[test]
    fn selector_uses_the_key_found_on_the_job() {
        let mut job = JobSnapshot { namespace: "ns".into(), name: "j".into(), ..Default::default() };
        job.selector.insert("batch.kubernetes.io/controller-uid".into(), "abc".into());
        let sel = controller_selector(&job, "controller-uid").expect("selector");
        assert_eq!(sel.to_string(), "batch.kubernetes.io/controller-uid=abc");
    }

    #[tokio::test]
    async fn warning_events_join_in_listing_order() {
        let store = InMemoryStore::default();
        let ev = |name: &str, kind, reason: &str, msg: &str| EventRecord {
            involved_name: name.into(),
            kind,
            reason: reason.into(),
            message: msg.into(),
        };
        store.add_event("ns", ev("p", EventType::Warning, "BackOff", "restarting"));
        store.add_event("ns", ev("p", EventType::Normal, "Pulled", "image pulled"));
        store.add_event("ns", ev("other", EventType::Warning, "Nope", "not ours"));
        store.add_event("ns", ev("p", EventType::Warning, "Failed", "exit 1"));
        let mut p = pod("p", None);
        p.namespace = "ns".into();
        let text = warning_events(&store, &p).await.expect("events");
        assert_eq!(text, "BackOff - restarting\nFailed - exit 1");
    }
}
