//! Action step execution.
//!
//! Runs the sub-actions of an action step in declaration order against the
//! execution context. Side effects go through collaborator traits:
//! [`Notifier`], [`HttpClient`] and [`RecordService`].

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::engine::interpolate::{interpolate_str, interpolate_value};
use crate::error::{AppError, AppResult};
use crate::workflow::types::{
    ActionKind, HttpRequestSpec, LogLevel, LogSpec, NotifySpec, RecordSpec, SubAction,
};

// ============================================================================
// Collaborators
// ============================================================================

/// An interpolated notification.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub recipients: Vec<String>,
    pub subject: Option<String>,
    pub message: String,
    pub channel: Option<String>,
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, notification: &Notification) -> AppResult<()>;
}

/// Emits notifications as log events. Transport lives elsewhere.
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, notification: &Notification) -> AppResult<()> {
        tracing::info!(
            recipients = ?notification.recipients,
            channel = notification.channel.as_deref().unwrap_or("default"),
            subject = notification.subject.as_deref().unwrap_or(""),
            message = %notification.message,
            "Notification"
        );
        Ok(())
    }
}

/// An interpolated outbound HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Value>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: Value,
}

#[async_trait]
pub trait HttpClient: Send + Sync {
    async fn request(&self, request: HttpRequest) -> AppResult<HttpResponse>;
}

/// `reqwest`-backed HTTP client.
#[derive(Clone, Default)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn request(&self, request: HttpRequest) -> AppResult<HttpResponse> {
        let method = reqwest::Method::from_bytes(request.method.to_uppercase().as_bytes())
            .map_err(|_| AppError::Validation(format!("invalid HTTP method '{}'", request.method)))?;

        let mut builder = self
            .client
            .request(method, &request.url)
            .timeout(request.timeout);
        for (key, value) in &request.headers {
            builder = builder.header(key.as_str(), value.as_str());
        }
        if let Some(ref body) = request.body {
            builder = match body {
                Value::String(s) => builder.body(s.clone()),
                other => builder.json(other),
            };
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let text = response.text().await.unwrap_or_default();
        let body = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(HttpResponse { status, body })
    }
}

/// Create/update records in external services (CRM, ticketing, ...).
#[async_trait]
pub trait RecordService: Send + Sync {
    async fn create_record(&self, service: &str, entity: &str, data: &Value) -> AppResult<Value>;

    async fn update_record(
        &self,
        service: &str,
        entity: &str,
        id: &str,
        data: &Value,
    ) -> AppResult<Value>;
}

/// Rejects every record operation.
#[derive(Debug, Default)]
pub struct UnconfiguredRecordService;

#[async_trait]
impl RecordService for UnconfiguredRecordService {
    async fn create_record(&self, service: &str, entity: &str, _data: &Value) -> AppResult<Value> {
        Err(AppError::ExternalService(format!(
            "no record service configured for {}/{}",
            service, entity
        )))
    }

    async fn update_record(
        &self,
        service: &str,
        entity: &str,
        _id: &str,
        _data: &Value,
    ) -> AppResult<Value> {
        Err(AppError::ExternalService(format!(
            "no record service configured for {}/{}",
            service, entity
        )))
    }
}

// ============================================================================
// Executor
// ============================================================================

/// Outcome of an action step.
#[derive(Debug, Clone, Serialize)]
pub struct ActionOutcome {
    pub action: ActionKind,
    /// `allowed`, `blocked` or `executed`.
    pub result: &'static str,
    /// One output per sub-action, in order.
    pub outputs: Vec<Value>,
}

impl ActionOutcome {
    pub fn to_value(&self) -> Value {
        json!({
            "action": self.action,
            "result": self.result,
            "outputs": self.outputs,
        })
    }
}

#[derive(Clone)]
pub struct ActionExecutor {
    notifier: Arc<dyn Notifier>,
    http: Arc<dyn HttpClient>,
    records: Arc<dyn RecordService>,
    default_http_timeout: Duration,
}

impl ActionExecutor {
    pub fn new(
        notifier: Arc<dyn Notifier>,
        http: Arc<dyn HttpClient>,
        records: Arc<dyn RecordService>,
        default_http_timeout: Duration,
    ) -> Self {
        Self {
            notifier,
            http,
            records,
            default_http_timeout,
        }
    }

    /// Run every sub-action, stopping at the first failure.
    pub async fn execute(
        &self,
        action: ActionKind,
        sub_actions: &[SubAction],
        context: &Value,
    ) -> AppResult<ActionOutcome> {
        let mut outputs = Vec::with_capacity(sub_actions.len());
        for sub in sub_actions {
            outputs.push(self.run_sub_action(sub, context).await?);
        }
        Ok(ActionOutcome {
            action,
            result: action.result_label(),
            outputs,
        })
    }

    pub async fn run_sub_action(&self, sub: &SubAction, context: &Value) -> AppResult<Value> {
        match sub {
            SubAction::Notify(spec) => self.notify(spec, context).await,
            SubAction::Webhook(spec) | SubAction::HttpRequest(spec) => {
                self.http_request(spec, context).await
            }
            SubAction::CreateRecord(spec) => {
                let data = interpolate_value(&spec.data, context)?;
                self.records
                    .create_record(&spec.service, &spec.entity, &data)
                    .await
            }
            SubAction::UpdateRecord(spec) => self.update_record(spec, context).await,
            SubAction::Log(spec) => log(spec, context),
        }
    }

    async fn notify(&self, spec: &NotifySpec, context: &Value) -> AppResult<Value> {
        let notification = Notification {
            recipients: spec
                .recipients
                .iter()
                .map(|r| interpolate_str(r, context))
                .collect::<AppResult<_>>()?,
            subject: spec
                .subject
                .as_deref()
                .map(|s| interpolate_str(s, context))
                .transpose()?,
            message: interpolate_str(&spec.message, context)?,
            channel: spec.channel.clone(),
        };
        self.notifier.notify(&notification).await?;
        Ok(json!({"notified": notification.recipients}))
    }

    async fn http_request(&self, spec: &HttpRequestSpec, context: &Value) -> AppResult<Value> {
        let request = HttpRequest {
            method: spec.method.clone(),
            url: interpolate_str(&spec.url, context)?,
            headers: spec
                .headers
                .iter()
                .map(|(k, v)| Ok((k.clone(), interpolate_str(v, context)?)))
                .collect::<AppResult<_>>()?,
            body: spec
                .body
                .as_ref()
                .map(|b| interpolate_value(b, context))
                .transpose()?,
            timeout: spec
                .timeout_seconds
                .map(Duration::from_secs)
                .unwrap_or(self.default_http_timeout),
        };

        let url = request.url.clone();
        let response = self.http.request(request).await?;
        if !(200..300).contains(&response.status) {
            return Err(AppError::Http {
                status: response.status,
                message: format!("{} {} returned {}", spec.method, url, response.status),
            });
        }
        Ok(json!({"status": response.status, "body": response.body}))
    }

    async fn update_record(&self, spec: &RecordSpec, context: &Value) -> AppResult<Value> {
        let id = spec
            .id
            .as_deref()
            .ok_or_else(|| {
                AppError::Validation(format!(
                    "update_record on {}/{} requires an id",
                    spec.service, spec.entity
                ))
            })
            .and_then(|id| interpolate_str(id, context))?;
        let data = interpolate_value(&spec.data, context)?;
        self.records
            .update_record(&spec.service, &spec.entity, &id, &data)
            .await
    }
}

fn log(spec: &LogSpec, context: &Value) -> AppResult<Value> {
    let message = interpolate_str(&spec.message, context)?;
    let fields = spec
        .fields
        .as_ref()
        .map(|f| interpolate_value(f, context))
        .transpose()?
        .unwrap_or(Value::Null);

    match spec.level {
        LogLevel::Debug => tracing::debug!(target: "storeflow_workflow", fields = %fields, "{}", message),
        LogLevel::Info => tracing::info!(target: "storeflow_workflow", fields = %fields, "{}", message),
        LogLevel::Warn => tracing::warn!(target: "storeflow_workflow", fields = %fields, "{}", message),
        LogLevel::Error => tracing::error!(target: "storeflow_workflow", fields = %fields, "{}", message),
    }

    Ok(json!({"logged": message}))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub(crate) struct RecordingNotifier {
        pub sent: Mutex<Vec<Notification>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn notify(&self, notification: &Notification) -> AppResult<()> {
            self.sent.lock().unwrap().push(notification.clone());
            Ok(())
        }
    }

    /// Replies with queued statuses, then 200.
    #[derive(Default)]
    pub(crate) struct ScriptedHttp {
        pub statuses: Mutex<Vec<u16>>,
        pub requests: Mutex<Vec<HttpRequest>>,
    }

    #[async_trait]
    impl HttpClient for ScriptedHttp {
        async fn request(&self, request: HttpRequest) -> AppResult<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            let mut statuses = self.statuses.lock().unwrap();
            let status = if statuses.is_empty() { 200 } else { statuses.remove(0) };
            Ok(HttpResponse {
                status,
                body: json!({"ok": status < 300}),
            })
        }
    }

    fn executor(
        notifier: Arc<RecordingNotifier>,
        http: Arc<ScriptedHttp>,
    ) -> ActionExecutor {
        ActionExecutor::new(
            notifier,
            http,
            Arc::new(UnconfiguredRecordService),
            Duration::from_secs(5),
        )
    }

    fn subs(v: Value) -> Vec<SubAction> {
        serde_json::from_value(v).unwrap()
    }

    #[tokio::test]
    async fn test_notify_interpolates() {
        let notifier = Arc::new(RecordingNotifier::default());
        let exec = executor(notifier.clone(), Arc::new(ScriptedHttp::default()));
        let ctx = json!({"event": {"order": {"id": "o-7"}}, "customer": {"email": "c@x.io"}});

        let outcome = exec
            .execute(
                ActionKind::Execute,
                &subs(json!([{
                    "type": "notify",
                    "recipients": ["${customer.email}"],
                    "message": "Order ${order.id} needs review"
                }])),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(outcome.result, "executed");
        let sent = notifier.sent.lock().unwrap();
        assert_eq!(sent[0].recipients, vec!["c@x.io"]);
        assert_eq!(sent[0].message, "Order o-7 needs review");
    }

    #[tokio::test]
    async fn test_webhook_non_2xx_is_http_error() {
        let http = Arc::new(ScriptedHttp::default());
        http.statuses.lock().unwrap().push(503);
        let exec = executor(Arc::new(RecordingNotifier::default()), http.clone());

        let err = exec
            .execute(
                ActionKind::Allow,
                &subs(json!([{
                    "type": "webhook",
                    "url": "https://hooks.example.com/${order.id}",
                    "body": {"total": "${order.total}"}
                }])),
                &json!({"event": {"order": {"id": "o-1", "total": 99}}}),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Http { status: 503, .. }));
        let requests = http.requests.lock().unwrap();
        assert_eq!(requests[0].url, "https://hooks.example.com/o-1");
        assert_eq!(requests[0].body, Some(json!({"total": 99})));
        assert_eq!(requests[0].method, "POST");
    }

    #[tokio::test]
    async fn test_unresolved_token_fails_before_side_effect() {
        let http = Arc::new(ScriptedHttp::default());
        let exec = executor(Arc::new(RecordingNotifier::default()), http.clone());
        let err = exec
            .execute(
                ActionKind::Execute,
                &subs(json!([{"type": "http_request", "url": "https://api/${missing.path}"}])),
                &json!({"event": {}}),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Interpolation(_)));
        assert!(http.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_and_log_sub_actions() {
        let exec = executor(
            Arc::new(RecordingNotifier::default()),
            Arc::new(ScriptedHttp::default()),
        );
        let ctx = json!({"event": {"order": {"id": "o-2"}}});

        let logged = exec
            .execute(
                ActionKind::Allow,
                &subs(json!([{"type": "log", "message": "allowed ${order.id}", "level": "info"}])),
                &ctx,
            )
            .await
            .unwrap();
        assert_eq!(logged.outputs[0], json!({"logged": "allowed o-2"}));

        let err = exec
            .execute(
                ActionKind::Execute,
                &subs(json!([{"type": "create_record", "service": "crm", "entity": "ticket"}])),
                &ctx,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::ExternalService(_)));
    }
}
