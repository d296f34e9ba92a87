//! End-to-end lifecycle tests against a running server instance.

use std::sync::Arc;

use refill_server::handlers::{router, AppState};
use refill_server::models::refill::{NewRefill, RefillStatus};
use refill_server::models::routing::{Provider, RoutingConfig, RoutingStrategy};
use refill_server::store::{MemStore, Store};
use serde_json::{json, Value};

struct TestServer {
    base: String,
    store: Arc<MemStore>,
    client: reqwest::Client,
}

impl TestServer {
    async fn spawn() -> Self {
        let store = Arc::new(MemStore::new());
        let app = router(AppState::new(store.clone()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Self {
            base: format!("http://{}", addr),
            store,
            client: reqwest::Client::new(),
        }
    }

    fn post(&self, path: &str, user_id: i64, clinic_id: i64, role: &str) -> reqwest::RequestBuilder {
        self.client
            .post(format!("{}{}", self.base, path))
            .header("x-user-id", user_id)
            .header("x-clinic-id", clinic_id)
            .header("x-user-role", role)
    }

    async fn seed_pending_payment_refill(&self, clinic_id: i64) -> i64 {
        self.store
            .insert_refill(NewRefill {
                patient_id: 1,
                clinic_id,
                subscription_id: None,
                status: RefillStatus::PendingPayment,
                payment_verified: false,
                medication: "semaglutide 0.5mg".to_string(),
                ship_to_state: "TX".to_string(),
                shipment_number: 1,
                total_shipments: 1,
                parent_refill_id: None,
            })
            .await
            .unwrap()
            .id
    }
}

#[tokio::test]
async fn test_full_refill_lifecycle() {
    let server = TestServer::spawn().await;
    server.store.seed_clinic(RoutingConfig {
        clinic_id: 1,
        routing_enabled: true,
        strategy: RoutingStrategy::ProviderChoice,
    });
    server.store.seed_provider(Provider {
        id: 9,
        clinic_id: 1,
        display_name: "Dr. Nine".to_string(),
        licensed_states: vec!["TX".to_string()],
    });
    let refill_id = server.seed_pending_payment_refill(1).await;

    // Payment webhook moves the entry to admin review.
    let resp = server
        .client
        .post(format!("{}/webhooks/billing", server.base))
        .json(&json!({ "type": "refill_payment", "refill_id": refill_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["refill"]["status"], "pending_admin");

    // Admin approves with an idempotency key.
    let resp = server
        .post(&format!("/refill-queue/{}/approve", refill_id), 7, 1, "admin")
        .header("idempotency-key", "approve-1")
        .json(&json!({ "notes": "verified by phone" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let approved: Value = resp.json().await.unwrap();
    assert_eq!(approved["refill"]["status"], "pending_provider");
    let order_id = approved["order_id"].as_i64().unwrap();

    // Retrying the same key replays the identical response.
    let resp = server
        .post(&format!("/refill-queue/{}/approve", refill_id), 7, 1, "admin")
        .header("idempotency-key", "approve-1")
        .json(&json!({ "notes": "verified by phone" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let replayed: Value = resp.json().await.unwrap();
    assert_eq!(replayed, approved);

    // The order shows up in the provider's pull pool.
    let resp = server
        .client
        .get(format!("{}/provider/routing/available", server.base))
        .header("x-user-id", 9)
        .header("x-clinic-id", 1)
        .header("x-user-role", "provider")
        .send()
        .await
        .unwrap();
    let pool: Value = resp.json().await.unwrap();
    assert_eq!(pool["enabled"], true);
    assert_eq!(pool["available"][0]["id"], order_id);

    // Provider claims and completes.
    let resp = server
        .post("/provider/routing/claim", 9, 1, "provider")
        .json(&json!({ "order_id": order_id }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let resp = server
        .post(&format!("/orders/{}/complete", order_id), 9, 1, "provider")
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let done: Value = resp.json().await.unwrap();
    assert_eq!(done["order"]["status"], "completed");

    let refill = server.store.refill(refill_id).await.unwrap().unwrap();
    assert_eq!(refill.status, RefillStatus::Completed);
}

#[tokio::test]
async fn test_approve_requires_verified_payment() {
    let server = TestServer::spawn().await;
    let refill_id = server.seed_pending_payment_refill(1).await;

    let resp = server
        .post(&format!("/refill-queue/{}/approve", refill_id), 7, 1, "admin")
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("not awaiting admin review"));
}

#[tokio::test]
async fn test_cross_clinic_refill_is_invisible() {
    let server = TestServer::spawn().await;
    let refill_id = server.seed_pending_payment_refill(1).await;

    let resp = server
        .post(&format!("/refill-queue/{}/cancel", refill_id), 7, 2, "admin")
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 404);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body["error"],
        format!("Refill {} not found", refill_id)
    );
}

#[tokio::test]
async fn test_concurrent_claims_one_winner_over_http() {
    let server = TestServer::spawn().await;
    server.store.seed_clinic(RoutingConfig {
        clinic_id: 1,
        routing_enabled: true,
        strategy: RoutingStrategy::ProviderChoice,
    });
    for id in [9, 10] {
        server.store.seed_provider(Provider {
            id,
            clinic_id: 1,
            display_name: format!("Dr. {}", id),
            licensed_states: vec!["TX".to_string()],
        });
    }
    let refill_id = server.seed_pending_payment_refill(1).await;
    server
        .store
        .verify_refill_payment(refill_id)
        .await
        .unwrap();

    let resp = server
        .post(&format!("/refill-queue/{}/approve", refill_id), 7, 1, "admin")
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    let approved: Value = resp.json().await.unwrap();
    let order_id = approved["order_id"].as_i64().unwrap();

    let first = server
        .post("/provider/routing/claim", 9, 1, "provider")
        .json(&json!({ "order_id": order_id }));
    let second = server
        .post("/provider/routing/claim", 10, 1, "provider")
        .json(&json!({ "order_id": order_id }));
    let (a, b) = tokio::join!(first.send(), second.send());
    let statuses = [a.unwrap().status().as_u16(), b.unwrap().status().as_u16()];

    assert!(statuses.contains(&200), "one claim must win: {:?}", statuses);
    assert!(statuses.contains(&409), "one claim must lose: {:?}", statuses);
}

#[tokio::test]
async fn test_decline_reason_is_validated_over_http() {
    let server = TestServer::spawn().await;
    let refill_id = server.seed_pending_payment_refill(1).await;
    server
        .store
        .verify_refill_payment(refill_id)
        .await
        .unwrap();

    let resp = server
        .post(&format!("/refill-queue/{}/approve", refill_id), 7, 1, "admin")
        .json(&json!({}))
        .send()
        .await
        .unwrap();
    let approved: Value = resp.json().await.unwrap();
    let order_id = approved["order_id"].as_i64().unwrap();

    let resp = server
        .post(&format!("/orders/{}/decline", order_id), 7, 1, "admin")
        .json(&json!({ "reason": "short" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(
        body["error"],
        "Decline reason must be at least 10 characters"
    );
}
