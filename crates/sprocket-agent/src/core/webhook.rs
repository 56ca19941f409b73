use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sprocket_proto::{ArgsPayload, Value};

use super::registry::{AppFn, HandlerError, RawHandler};

/// HTTP-shaped request value handed to webhook handlers. The gateway
/// builds it on the control-plane side; here it only needs decoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookRequest {
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub headers: sprocket_proto::Kwargs,
    #[serde(default)]
    pub body: Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: sprocket_proto::Kwargs,
    #[serde(default)]
    pub body: Value,
}

fn default_method() -> String {
    "GET".to_string()
}

impl WebhookResponse {
    pub fn ok(body: Value) -> Self {
        Self { status: 200, headers: Default::default(), body }
    }

    pub fn method_not_allowed(method: &str) -> Self {
        Self {
            status: 405,
            headers: Default::default(),
            body: Value::String(format!("method {method} not allowed")),
        }
    }

    fn into_value(self) -> Result<Value, HandlerError> {
        serde_json::to_value(self).map_err(|err| {
            HandlerError::new(
                "SerializationError",
                format!("webhook response encode failed: {err}"),
            )
        })
    }
}

/// Turns a webhook application into a dispatchable handler. The request
/// travels as the first positional argument; the response value is the
/// single scalar output. Always async regardless of the app's origin.
pub fn wrap_app(app: AppFn) -> RawHandler {
    RawHandler::Async(Arc::new(move |payload: ArgsPayload| {
        let app = app.clone();
        Box::pin(async move {
            let request =
                payload.args.into_iter().next().unwrap_or(Value::Null);
            app(request).await
        })
    }))
}

/// Synthesizes an application from a bare scalar handler, for functions
/// exposed as raw webhooks without writing an app themselves. The
/// handler sees the request body as its only argument.
pub fn app_from_scalar(
    fun: &RawHandler,
    allowed_method: Option<String>,
) -> Result<AppFn, HandlerError> {
    let allowed = allowed_method.unwrap_or_else(default_method);

    match fun {
        RawHandler::Sync(fun) => {
            let fun = fun.clone();
            Ok(Arc::new(move |request: Value| {
                let fun = fun.clone();
                let allowed = allowed.clone();
                Box::pin(async move {
                    let request = decode_request(request)?;
                    if !request.method.eq_ignore_ascii_case(&allowed) {
                        return WebhookResponse::method_not_allowed(
                            &request.method,
                        )
                        .into_value();
                    }
                    let payload = ArgsPayload {
                        args: vec![request.body],
                        kwargs: Default::default(),
                    };
                    let body = fun(payload)?;
                    WebhookResponse::ok(body).into_value()
                })
            }))
        }
        RawHandler::Async(fun) => {
            let fun = fun.clone();
            Ok(Arc::new(move |request: Value| {
                let fun = fun.clone();
                let allowed = allowed.clone();
                Box::pin(async move {
                    let request = decode_request(request)?;
                    if !request.method.eq_ignore_ascii_case(&allowed) {
                        return WebhookResponse::method_not_allowed(
                            &request.method,
                        )
                        .into_value();
                    }
                    let payload = ArgsPayload {
                        args: vec![request.body],
                        kwargs: Default::default(),
                    };
                    let body = fun(payload).await?;
                    WebhookResponse::ok(body).into_value()
                })
            }))
        }
        other => Err(HandlerError::new(
            "BadReturnType",
            format!(
                "raw webhook requires a scalar handler, found {}",
                other.shape_name()
            ),
        )),
    }
}

fn decode_request(value: Value) -> Result<WebhookRequest, HandlerError> {
    serde_json::from_value(value).map_err(|err| {
        HandlerError::new(
            "SerializationError",
            format!("webhook request decode failed: {err}"),
        )
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn request_value(method: &str, body: Value) -> Value {
        json!({
            "method": method,
            "path": "/run",
            "headers": {},
            "body": body,
        })
    }

    #[tokio::test]
    async fn raw_webhook_calls_scalar_with_request_body() {
        let fun = RawHandler::Sync(Arc::new(|payload: ArgsPayload| {
            let x = payload.args[0].as_i64().unwrap_or(0);
            Ok(json!(x + 1))
        }));
        let app =
            app_from_scalar(&fun, Some("POST".to_string())).unwrap();
        let RawHandler::Async(wrapped) = wrap_app(app) else {
            panic!("webhook wrapper must be async");
        };

        let payload = ArgsPayload {
            args: vec![request_value("POST", json!(3))],
            kwargs: Default::default(),
        };
        let response = wrapped(payload).await.unwrap();
        assert_eq!(response["status"], json!(200));
        assert_eq!(response["body"], json!(4));
    }

    #[tokio::test]
    async fn raw_webhook_rejects_wrong_method() {
        let fun = RawHandler::Sync(Arc::new(|_| Ok(json!(null))));
        let app =
            app_from_scalar(&fun, Some("POST".to_string())).unwrap();
        let response =
            app(request_value("GET", json!(null))).await.unwrap();
        assert_eq!(response["status"], json!(405));
    }

    #[test]
    fn generator_handlers_cannot_back_a_webhook() {
        use super::super::registry::SyncIter;

        let fun = RawHandler::SyncGen(Arc::new(|_| {
            Ok(Box::new(std::iter::empty()) as SyncIter)
        }));
        let err = match app_from_scalar(&fun, None) {
            Err(err) => err,
            Ok(_) => panic!("expected app_from_scalar to return an error"),
        };
        assert_eq!(err.kind, "BadReturnType");
    }
}
