/// Example: Shared Record Refresh
///
/// Several processes wrap the same stored credential. Each one forces a refresh;
/// the file-backed lease makes sure only one of them performs the (simulated)
/// token exchange while the others adopt its result.
///
/// Run multiple instances simultaneously to see the coordination:
/// ```bash
/// RUST_LOG=tokenwrap=debug cargo run --example shared_record &
/// RUST_LOG=tokenwrap=debug cargo run --example shared_record &
/// RUST_LOG=tokenwrap=debug cargo run --example shared_record &
/// wait
/// ```
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokenwrap::prelude::*;
use tracing_subscriber::EnvFilter;

const KEY: &str = "example.com:shared-record";

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let pid = std::process::id();
    println!("=== Shared Record Refresh (process {}) ===\n", pid);

    let settings = Settings::default();
    let store = Arc::new(
        FileStore::new("tokenwrap-shared-record-example").expect("Failed to create file storage"),
    );
    let leases = Arc::new(
        FileLockStore::for_app("tokenwrap-shared-record-example")
            .expect("Failed to create lease directory"),
    );

    // Seed an already-expired credential the first time around
    if store.get_credential(KEY).ok().flatten().is_none() {
        store
            .save_credential(
                KEY,
                Credential::new("old_access_token", "refresh_token_12345", Some(now() - 1)),
            )
            .expect("Failed to seed credential");
    }

    // Stand-in for HttpRefresher: a slow token exchange
    let refresher = move |old: &Credential| -> tokenwrap::error::Result<Credential> {
        println!("  [{}] calling token endpoint...", pid);
        std::thread::sleep(Duration::from_millis(500));
        Ok(Credential::new(
            format!("access_from_{}", pid),
            old.refresh_token.clone(),
            Some(now() + 3600),
        ))
    };

    let record = StoredRecord::load(store.clone(), KEY).expect("Failed to load record");
    let mut persist = persist_to(store.clone(), KEY);
    let mut proxy = TokenProxy::from_record(
        record,
        refresher,
        settings.lease_lock(leases),
        Arc::new(settings.configuration()),
        move |credential: &Credential, failure: Option<&dyn Failure>| {
            println!("  [{}] now using {}", pid, credential.token);
            persist(credential, failure);
        },
    );

    println!("Starting token: {}", proxy.token());

    // Pretend the API rejected the current token once
    let mut rejected = false;
    let result = proxy.forward(|credential| {
        if !rejected {
            rejected = true;
            return Err(ResponseError::new(401, serde_json::Value::Null));
        }
        Ok(format!("called API with {}", credential.token))
    });

    match result {
        Ok(message) => println!("\n✓ {}", message),
        Err(e) if e.is_contention() => println!("\nLease busy, try again later: {}", e),
        Err(e) => println!("\nRequest failed: {}", e),
    }

    if proxy.token() == format!("access_from_{}", pid) {
        println!("  This process performed the refresh");
    } else {
        println!("  Adopted the credential another process stored");
    }
}
