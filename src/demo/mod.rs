//! Demo concepts and syncs — Echo, a minimal User/Password/Token
//! registration flow, and a PessimisticLock — wired together just enough to
//! exercise the core end to end. Not a CLI surface generator: this is
//! demonstration plumbing for `src/bin/kernel-demo.rs`.

pub mod echo;
pub mod lock;
pub mod password;
pub mod resolve;
pub mod support;
pub mod token;
pub mod user;

use crate::kernel::Kernel;
use crate::model::{
    Annotation, CompiledSync, Expr, FieldMatch, FieldPattern, TemplateValue, ThenField,
    ThenTemplate, WhenPattern,
};
use crate::storage::InMemoryStorage;
use serde_json::Value;
use std::sync::Arc;

/// Registers Echo, User, Password, Token, and PessimisticLock as in-process
/// concepts, each with its own fresh storage.
pub async fn register_concepts(kernel: &Kernel) {
    kernel
        .register_concept("Echo", Arc::new(echo::EchoHandler), Arc::new(InMemoryStorage::new()))
        .await;
    kernel
        .register_concept("User", Arc::new(user::UserHandler), Arc::new(InMemoryStorage::new()))
        .await;
    kernel
        .register_concept(
            "Password",
            Arc::new(password::PasswordHandler),
            Arc::new(InMemoryStorage::new()),
        )
        .await;
    kernel
        .register_concept("Token", Arc::new(token::TokenHandler), Arc::new(InMemoryStorage::new()))
        .await;
    kernel
        .register_concept(
            "PessimisticLock",
            Arc::new(lock::LockHandler),
            Arc::new(InMemoryStorage::new()),
        )
        .await;
}

fn literal(value: Value) -> FieldMatch {
    FieldMatch::Literal { value }
}

fn var(name: &str) -> FieldMatch {
    FieldMatch::Variable { name: name.to_string() }
}

fn field(name: &str, matcher: FieldMatch) -> FieldPattern {
    FieldPattern {
        name: name.to_string(),
        matcher,
    }
}

fn then_var(name: &str, variable: &str) -> ThenField {
    ThenField {
        name: name.to_string(),
        value: TemplateValue::Variable { name: variable.to_string() },
    }
}

fn then_literal(name: &str, value: Value) -> ThenField {
    ThenField {
        name: name.to_string(),
        value: TemplateValue::Literal { value },
    }
}

fn object_of(pairs: &[(&str, &str)]) -> Expr {
    let mut args = Vec::new();
    for (key, variable) in pairs {
        args.push(Expr::Literal { value: Value::String((*key).to_string()) });
        args.push(Expr::Var { name: (*variable).to_string() });
    }
    Expr::Call { name: "object".into(), args }
}

/// Echo round trip: `Web/request{method:"echo"}` →
/// `Echo/send` → `Web/respond{body:{echo}}`.
pub fn echo_syncs() -> Vec<CompiledSync> {
    vec![
        CompiledSync {
            name: "HandleEcho".into(),
            annotations: vec![Annotation::Eager],
            when: vec![WhenPattern {
                concept: "Web".into(),
                action: "request".into(),
                input_fields: vec![
                    field("method", literal(Value::String("echo".into()))),
                    field("text", var("text")),
                ],
                output_fields: vec![],
                variant: None,
            }],
            r#where: vec![],
            then: vec![ThenTemplate {
                concept: "Echo".into(),
                action: "send".into(),
                fields: vec![then_var("text", "text")],
            }],
        },
        CompiledSync {
            name: "EchoResponse".into(),
            annotations: vec![Annotation::Eager],
            when: vec![WhenPattern {
                concept: "Echo".into(),
                action: "send".into(),
                input_fields: vec![],
                output_fields: vec![field("echo", var("text"))],
                variant: Some("ok".into()),
            }],
            r#where: vec![],
            then: vec![ThenTemplate {
                concept: "Web".into(),
                action: "respond".into(),
                fields: vec![ThenField {
                    name: "body".into(),
                    value: TemplateValue::Template { expr: object_of(&[("echo", "text")]) },
                }],
            }],
        },
    ]
}

/// Registration flow: validates the password,
/// registers the user, sets the hashed password, issues a token, and
/// responds with `{user: {username, token}}` — or, if the password fails
/// validation, `code: 422`.
pub fn registration_syncs() -> Vec<CompiledSync> {
    let register_trigger = || WhenPattern {
        concept: "Web".into(),
        action: "request".into(),
        input_fields: vec![
            field("method", literal(Value::String("register".into()))),
            field("username", var("username")),
            field("email", var("email")),
            field("password", var("password")),
        ],
        output_fields: vec![],
        variant: None,
    };

    vec![
        CompiledSync {
            name: "ValidatePassword".into(),
            annotations: vec![Annotation::Eager],
            when: vec![register_trigger()],
            r#where: vec![],
            then: vec![ThenTemplate {
                concept: "Password".into(),
                action: "validate".into(),
                fields: vec![then_var("password", "password")],
            }],
        },
        CompiledSync {
            name: "RegisterUser".into(),
            annotations: vec![Annotation::Eager],
            when: vec![
                register_trigger(),
                WhenPattern {
                    concept: "Password".into(),
                    action: "validate".into(),
                    input_fields: vec![],
                    output_fields: vec![field("valid", literal(Value::Bool(true)))],
                    variant: Some("ok".into()),
                },
            ],
            r#where: vec![],
            then: vec![ThenTemplate {
                concept: "User".into(),
                action: "register".into(),
                fields: vec![
                    then_var("user", "username"),
                    then_var("name", "username"),
                    then_var("email", "email"),
                ],
            }],
        },
        CompiledSync {
            name: "SetPassword".into(),
            annotations: vec![Annotation::Eager],
            when: vec![
                register_trigger(),
                WhenPattern {
                    concept: "Password".into(),
                    action: "validate".into(),
                    input_fields: vec![],
                    output_fields: vec![field("valid", literal(Value::Bool(true)))],
                    variant: Some("ok".into()),
                },
            ],
            r#where: vec![],
            then: vec![ThenTemplate {
                concept: "Password".into(),
                action: "set".into(),
                fields: vec![then_var("user", "username"), then_var("password", "password")],
            }],
        },
        CompiledSync {
            name: "GenerateToken".into(),
            annotations: vec![Annotation::Eager],
            when: vec![WhenPattern {
                concept: "User".into(),
                action: "register".into(),
                input_fields: vec![],
                output_fields: vec![field("user", var("username"))],
                variant: Some("ok".into()),
            }],
            r#where: vec![],
            then: vec![ThenTemplate {
                concept: "Token".into(),
                action: "generate".into(),
                fields: vec![then_var("user", "username")],
            }],
        },
        CompiledSync {
            name: "RegistrationResponse".into(),
            annotations: vec![Annotation::Eager],
            when: vec![WhenPattern {
                concept: "Token".into(),
                action: "generate".into(),
                input_fields: vec![],
                output_fields: vec![field("user", var("username")), field("token", var("token"))],
                variant: Some("ok".into()),
            }],
            r#where: vec![],
            then: vec![ThenTemplate {
                concept: "Web".into(),
                action: "respond".into(),
                fields: vec![ThenField {
                    name: "body".into(),
                    value: TemplateValue::Template {
                        expr: Expr::Call {
                            name: "object".into(),
                            args: vec![
                                Expr::Literal { value: Value::String("user".into()) },
                                object_of(&[("username", "username"), ("token", "token")]),
                            ],
                        },
                    },
                }],
            }],
        },
        CompiledSync {
            name: "RegistrationValidationError".into(),
            annotations: vec![Annotation::Eager],
            when: vec![WhenPattern {
                concept: "Password".into(),
                action: "validate".into(),
                input_fields: vec![],
                output_fields: vec![field("valid", literal(Value::Bool(false)))],
                variant: Some("ok".into()),
            }],
            r#where: vec![],
            then: vec![ThenTemplate {
                concept: "Web".into(),
                action: "respond".into(),
                fields: vec![
                    then_literal("code", Value::Number(422.into())),
                    then_literal("error", Value::String("invalid password".into())),
                ],
            }],
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::KernelConfig;
    use crate::lite_query::LiteQueryManager;
    use crate::log::InMemoryActionLog;
    use crate::registry::ConceptRegistry;
    use serde_json::json;

    async fn new_kernel() -> Kernel {
        let registry = Arc::new(ConceptRegistry::new());
        let log: Arc<dyn crate::log::ActionLog> = Arc::new(InMemoryActionLog::new());
        let lite_query = Arc::new(LiteQueryManager::new(KernelConfig::default().lite_query_ttl()));
        Kernel::new(registry, log, lite_query, KernelConfig::default())
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let kernel = new_kernel().await;
        register_concepts(&kernel).await;
        kernel.reload_syncs(echo_syncs());

        let mut payload = crate::model::Fields::new();
        payload.insert("text".to_string(), json!("hi"));
        let response = kernel.handle_request("echo", payload).await;

        assert_eq!(response.body, Some(json!({"echo": "hi"})));
    }

    #[tokio::test]
    async fn registration_succeeds_with_valid_password() {
        let kernel = new_kernel().await;
        register_concepts(&kernel).await;
        kernel.reload_syncs(registration_syncs());

        let mut payload = crate::model::Fields::new();
        payload.insert("username".to_string(), json!("alice"));
        payload.insert("email".to_string(), json!("a@x"));
        payload.insert("password".to_string(), json!("securepass123"));
        let response = kernel.handle_request("register", payload).await;

        let body = response.body.expect("expected a body");
        assert_eq!(body["user"]["username"], json!("alice"));
        assert!(body["user"]["token"].as_str().unwrap().len() > 0);
    }

    #[tokio::test]
    async fn registration_rejects_short_password() {
        let kernel = new_kernel().await;
        register_concepts(&kernel).await;
        kernel.reload_syncs(registration_syncs());

        let mut payload = crate::model::Fields::new();
        payload.insert("username".to_string(), json!("alice"));
        payload.insert("email".to_string(), json!("a@x"));
        payload.insert("password".to_string(), json!("short"));
        let response = kernel.handle_request("register", payload).await;

        assert_eq!(response.code, Some(422));
    }
}
