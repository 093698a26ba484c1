use crate::probe::{run_checks, Attempt, ProbeCheck, ProbeReport};
use berth_runtime::{OperatorClient, TemplateResolver};
use berth_schema::ReadinessCheck;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Probes an entity's readiness checks against their operator endpoints.
#[derive(Clone)]
pub struct ReadinessProber {
    operators: Arc<dyn OperatorClient>,
    templates: Arc<dyn TemplateResolver>,
    retry_interval: Duration,
    default_timeout: Duration,
}

impl ReadinessProber {
    pub fn new(
        operators: Arc<dyn OperatorClient>,
        templates: Arc<dyn TemplateResolver>,
        retry_interval: Duration,
        default_timeout: Duration,
    ) -> Self {
        Self {
            operators,
            templates,
            retry_interval,
            default_timeout,
        }
    }

    /// An empty list succeeds at once without contacting any operator.
    pub async fn probe(&self, checks: &[ReadinessCheck]) -> ProbeReport {
        let checks = checks
            .iter()
            .map(|check| {
                let operators = Arc::clone(&self.operators);
                let templates = Arc::clone(&self.templates);
                let check = check.clone();
                let timeout = check.timeout_or(self.default_timeout);
                ProbeCheck::new(check.name.clone(), timeout, move || {
                    let operators = Arc::clone(&operators);
                    let templates = Arc::clone(&templates);
                    let check = check.clone();
                    Box::pin(async move { attempt(operators, templates, check).await })
                })
            })
            .collect();
        run_checks(checks, self.retry_interval).await
    }
}

async fn attempt(
    operators: Arc<dyn OperatorClient>,
    templates: Arc<dyn TemplateResolver>,
    check: ReadinessCheck,
) -> Attempt {
    let body = match templates.resolve(&check.body) {
        Ok(resolution) => resolution.values,
        Err(e) => return Attempt::Retry(e.to_string()),
    };

    let call = tokio::task::spawn_blocking(move || {
        operators.call(&check.kind, &check.operator, &body)
    });
    match call.await {
        Ok(Ok(200)) => Attempt::Success,
        Ok(Ok(status)) => {
            debug!("operator answered {status}");
            Attempt::Retry(format!("operator answered {status}"))
        }
        Ok(Err(e)) => Attempt::Retry(e.to_string()),
        Err(e) => Attempt::Retry(format!("operator task failed: {e}")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::Verdict;
    use berth_runtime::{RuntimeError, StaticResolver};
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    /// Operator double answering from a script, then with `fallback`.
    struct ScriptedOperator {
        script: Mutex<Vec<u16>>,
        fallback: u16,
        calls: Mutex<Vec<(String, String, BTreeMap<String, String>)>>,
    }

    impl ScriptedOperator {
        fn new(script: &[u16], fallback: u16) -> Arc<Self> {
            let mut script = script.to_vec();
            script.reverse();
            Arc::new(Self {
                script: Mutex::new(script),
                fallback,
                calls: Mutex::new(Vec::new()),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.lock().unwrap().len()
        }
    }

    impl OperatorClient for ScriptedOperator {
        fn call(
            &self,
            kind: &str,
            operator: &str,
            body: &BTreeMap<String, String>,
        ) -> Result<u16, RuntimeError> {
            self.calls
                .lock()
                .unwrap()
                .push((kind.to_owned(), operator.to_owned(), body.clone()));
            Ok(self.script.lock().unwrap().pop().unwrap_or(self.fallback))
        }
    }

    fn check(name: &str, timeout: &str) -> ReadinessCheck {
        ReadinessCheck {
            name: name.to_owned(),
            operator: "postgres".to_owned(),
            kind: "readiness".to_owned(),
            timeout: Some(timeout.to_owned()),
            body: BTreeMap::from([(
                "password".to_owned(),
                "{{ secret.db.pg.password }}".to_owned(),
            )]),
        }
    }

    fn prober(operator: &Arc<ScriptedOperator>) -> ReadinessProber {
        let templates = StaticResolver::new().with("secret.db.pg.password", "hunter2");
        ReadinessProber::new(
            Arc::clone(operator) as Arc<dyn OperatorClient>,
            Arc::new(templates),
            Duration::from_millis(10),
            Duration::from_secs(5),
        )
    }

    #[tokio::test]
    async fn empty_list_is_ready_without_calls() {
        let operator = ScriptedOperator::new(&[], 500);
        let report = prober(&operator).probe(&[]).await;
        assert!(report.all_succeeded());
        assert_eq!(operator.call_count(), 0);
    }

    #[tokio::test]
    async fn body_is_rendered_before_the_call() {
        let operator = ScriptedOperator::new(&[], 200);
        let report = prober(&operator).probe(&[check("pg-up", "5s")]).await;
        assert!(report.all_succeeded());

        let calls = operator.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "readiness");
        assert_eq!(calls[0].1, "postgres");
        assert_eq!(calls[0].2["password"], "hunter2");
    }

    #[tokio::test]
    async fn retries_until_operator_answers_200() {
        let operator = ScriptedOperator::new(&[503, 503], 200);
        let report = prober(&operator).probe(&[check("pg-up", "5s")]).await;
        assert!(report.all_succeeded());
        assert_eq!(operator.call_count(), 3);
    }

    #[tokio::test]
    async fn fails_when_deadline_passes() {
        let operator = ScriptedOperator::new(&[], 503);
        let report = prober(&operator).probe(&[check("pg-up", "60ms")]).await;
        match &report.results[0].1 {
            Verdict::Failed(reason) => assert!(reason.contains("503")),
            other => panic!("unexpected verdict {other:?}"),
        }
    }

    #[tokio::test]
    async fn unresolved_template_never_reaches_operator() {
        let operator = ScriptedOperator::new(&[], 200);
        let prober = ReadinessProber::new(
            Arc::clone(&operator) as Arc<dyn OperatorClient>,
            Arc::new(StaticResolver::new()),
            Duration::from_millis(10),
            Duration::from_secs(5),
        );
        let report = prober.probe(&[check("pg-up", "50ms")]).await;
        assert!(!report.all_succeeded());
        assert_eq!(operator.call_count(), 0);
    }
}
