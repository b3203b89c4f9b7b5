//! Demonstration binary — wires Echo, the User/Password/Token registration
//! flow, and a PessimisticLock onto a `Kernel`, and drives one request
//! through it from the command line. Exists so logging/config/error wiring
//! has somewhere to run; it is not a CLI surface generator.

use clap::{Parser, Subcommand};
use copf_kernel::config::KernelConfig;
use copf_kernel::demo;
use copf_kernel::lite_query::LiteQueryManager;
use copf_kernel::log::InMemoryActionLog;
use copf_kernel::model::Fields;
use copf_kernel::registry::ConceptRegistry;
use copf_kernel::tracer::{get_flow_trace, render_pretty, TraceFilter};
use copf_kernel::Kernel;
use serde_json::json;
use std::process::ExitCode;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "kernel-demo", about = "Drive the concept-oriented runtime kernel from the command line")]
struct Cli {
    #[command(subcommand)]
    command: Command,
    /// Print the completion verbatim as JSON instead of a summary line.
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Echo round trip.
    Echo { text: String },
    /// Registration flow.
    Register {
        username: String,
        email: String,
        password: String,
    },
    /// Pessimistic lock check-out.
    LockCheckOut { resource: String, user: String },
    /// Pessimistic lock check-in.
    LockCheckIn { lock_id: String },
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = KernelConfig::load().unwrap_or_else(|err| {
        tracing::warn!(%err, "falling back to default kernel config");
        KernelConfig::default()
    });

    let registry = Arc::new(ConceptRegistry::new());
    let log: Arc<dyn copf_kernel::log::ActionLog> = Arc::new(InMemoryActionLog::new());
    let lite_query = Arc::new(LiteQueryManager::new(config.lite_query_ttl()));
    let kernel = Kernel::new(registry, log.clone(), lite_query, config);

    demo::register_concepts(&kernel).await;
    let mut syncs = demo::echo_syncs();
    syncs.extend(demo::registration_syncs());
    kernel.reload_syncs(syncs);

    match cli.command {
        Command::Echo { text } => {
            let mut payload = Fields::new();
            payload.insert("text".to_string(), json!(text));
            let response = kernel.handle_request("echo", payload).await;
            print_response(&response, cli.json, &log);
            exit_code(response.error.is_some())
        }
        Command::Register { username, email, password } => {
            let mut payload = Fields::new();
            payload.insert("username".to_string(), json!(username));
            payload.insert("email".to_string(), json!(email));
            payload.insert("password".to_string(), json!(password));
            let response = kernel.handle_request("register", payload).await;
            print_response(&response, cli.json, &log);
            exit_code(response.error.is_some() || response.code.is_some_and(|c| c >= 400))
        }
        Command::LockCheckOut { resource, user } => {
            let mut input = Fields::new();
            input.insert("resource".to_string(), json!(resource));
            input.insert("user".to_string(), json!(user));
            let completion = kernel.invoke_concept("PessimisticLock", "checkOut", input).await;
            print_completion(&completion, cli.json);
            exit_code(completion.is_error())
        }
        Command::LockCheckIn { lock_id } => {
            let mut input = Fields::new();
            input.insert("lock_id".to_string(), json!(lock_id));
            let completion = kernel.invoke_concept("PessimisticLock", "checkIn", input).await;
            print_completion(&completion, cli.json);
            exit_code(completion.is_error() || completion.variant == "notfound")
        }
    }
}

fn print_response(response: &copf_kernel::Response, as_json: bool, log: &Arc<dyn copf_kernel::log::ActionLog>) {
    if as_json {
        println!("{}", serde_json::to_string_pretty(response).unwrap());
        return;
    }
    println!("flow {}", response.flow_id);
    if let Some(body) = &response.body {
        println!("  body: {body}");
    }
    if let Some(code) = response.code {
        println!("  code: {code}");
    }
    if let Some(error) = &response.error {
        println!("  error: {error}");
    }
    if let Some(trace) = get_flow_trace(log.as_ref(), &response.flow_id, &[]) {
        println!("{}", render_pretty(&trace, TraceFilter::default()));
    }
}

fn print_completion(completion: &copf_kernel::ActionCompletion, as_json: bool) {
    if as_json {
        println!("{}", serde_json::to_string_pretty(completion).unwrap());
    } else {
        println!("{}/{} -> {} {:?}", completion.concept, completion.action, completion.variant, completion.output);
    }
}

fn exit_code(failed: bool) -> ExitCode {
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
