use std::collections::BTreeMap;
use std::env;

use anyhow::Context;
use rand::{distributions::Alphanumeric, Rng};
use sqlx::PgPool;
use uuid::Uuid;

use hookflow::db;
use hookflow::webhooks::{
    signer, AttemptsRepo, NewWebhook, RetryPolicy, StatsRepo, WebhooksRepo,
};

const USAGE: &str = "hookctl <command>\n\
     Commands:\n\
     - migrate\n\
     - reset\n\
     - seed-webhook <tenant_id> <url> <event,event,...> [secret]\n\
     - reactivate <webhook_id>\n\
     - attempts <webhook_id> <event_id>\n\
     - stats <webhook_id> [window_days]\n\
     - sign <secret> <body>\n\
     - verify <secret> <body> <signature>\n\
     \n\
     Uses DATABASE_URL or TEST_DATABASE_URL.\n";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    let args: Vec<String> = env::args().collect();

    let Some(command) = args.get(1) else {
        eprintln!("{USAGE}");
        std::process::exit(2);
    };

    // Offline helpers: no database needed.
    match command.as_str() {
        "sign" => {
            let usage = "sign <secret> <body>";
            let secret = arg(&args, 2, usage)?;
            let body = arg(&args, 3, usage)?;
            let digest = signer::sign(secret, body.as_bytes())?;
            println!("{}", signer::signature_header(&digest));
            return Ok(());
        }
        "verify" => {
            let usage = "verify <secret> <body> <signature>";
            let secret = arg(&args, 2, usage)?;
            let body = arg(&args, 3, usage)?;
            let sig = arg(&args, 4, usage)?;
            if signer::verify(secret, body.as_bytes(), sig) {
                println!("signature OK");
                return Ok(());
            }
            eprintln!("signature MISMATCH");
            std::process::exit(1);
        }
        _ => {}
    }

    let url = env::var("DATABASE_URL")
        .or_else(|_| env::var("TEST_DATABASE_URL"))
        .context("DATABASE_URL or TEST_DATABASE_URL must be set")?;
    let pool = db::make_pool(&url).await?;

    match command.as_str() {
        "migrate" => {
            db::run_migrations(&pool).await?;
            println!("migrations applied");
        }
        "reset" => reset(&pool).await?,
        "seed-webhook" => {
            let usage = "seed-webhook <tenant_id> <url> <event,event,...> [secret]";
            let tenant_id: Uuid = arg(&args, 2, usage)?.parse()?;
            let target = arg(&args, 3, usage)?;
            let events = arg(&args, 4, usage)?;
            let secret = args.get(5).cloned().unwrap_or_else(generate_secret);
            seed_webhook(&pool, tenant_id, target, events, secret).await?;
        }
        "reactivate" => {
            let webhook_id: Uuid = arg(&args, 2, "reactivate <webhook_id>")?.parse()?;
            if WebhooksRepo::new(pool.clone()).reactivate(webhook_id).await? {
                println!("webhook {webhook_id} reactivated");
            } else {
                eprintln!("webhook {webhook_id} not found");
                std::process::exit(1);
            }
        }
        "attempts" => {
            let usage = "attempts <webhook_id> <event_id>";
            let webhook_id: Uuid = arg(&args, 2, usage)?.parse()?;
            let event_id = arg(&args, 3, usage)?;
            print_sequence(&pool, webhook_id, event_id).await?;
        }
        "stats" => {
            let webhook_id: Uuid = arg(&args, 2, "stats <webhook_id> [window_days]")?.parse()?;
            let days: i64 = args.get(3).and_then(|s| s.parse().ok()).unwrap_or(30);
            let stats = StatsRepo::new(pool.clone()).for_webhook(webhook_id, days).await?;
            println!("{}", serde_json::to_string_pretty(&stats)?);
        }
        other => {
            eprintln!("Unknown command: {other}\n\n{USAGE}");
            std::process::exit(2);
        }
    }

    Ok(())
}

fn arg<'a>(args: &'a [String], idx: usize, usage: &str) -> anyhow::Result<&'a str> {
    args.get(idx)
        .map(String::as_str)
        .ok_or_else(|| anyhow::anyhow!("usage: hookctl {usage}"))
}

fn generate_secret() -> String {
    let token: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(32)
        .map(char::from)
        .collect();
    format!("whsec_{token}")
}

async fn reset(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::query("TRUNCATE TABLE delivery_attempts, webhooks CASCADE")
        .execute(pool)
        .await?;

    println!("reset OK");
    Ok(())
}

async fn seed_webhook(
    pool: &PgPool,
    tenant_id: Uuid,
    url: &str,
    events: &str,
    secret: String,
) -> anyhow::Result<()> {
    let policy = RetryPolicy::default();
    let webhook = WebhooksRepo::new(pool.clone())
        .insert(NewWebhook {
            tenant_id,
            url: url.to_string(),
            event_types: events
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            secret,
            custom_headers: BTreeMap::new(),
            max_attempts: policy.max_attempts,
            backoff_seconds: policy.backoff_columns(),
        })
        .await?;

    println!("+ webhook id={} url={}", webhook.id, webhook.url);
    println!("  events={:?}", webhook.event_types);
    println!("  secret={}", webhook.secret);
    Ok(())
}

async fn print_sequence(pool: &PgPool, webhook_id: Uuid, event_id: &str) -> anyhow::Result<()> {
    let attempts = AttemptsRepo::new(pool.clone())
        .list_sequence(webhook_id, event_id)
        .await?;

    if attempts.is_empty() {
        println!("no attempts for webhook={webhook_id} event={event_id}");
        return Ok(());
    }

    for a in attempts {
        println!(
            "#{} {:<16} http={} elapsed_ms={} code={} next_retry_at={} created_at={}",
            a.attempt_number,
            a.status,
            a.http_status.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            a.elapsed_ms.map(|s| s.to_string()).unwrap_or_else(|| "-".into()),
            a.error_code.as_deref().unwrap_or("-"),
            a.next_retry_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".into()),
            a.created_at.to_rfc3339(),
        );
        if let Some(msg) = a.error_message.as_deref() {
            println!("    {msg}");
        }
    }
    Ok(())
}
