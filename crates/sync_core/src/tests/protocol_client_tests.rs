use std::sync::{Arc, Mutex};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use shared::{domain::NotificationKind, error::ErrorCode};
use tokio::net::TcpListener;

use super::*;
use crate::test_support::{conversation_record, message_record, notification_record, user};

#[derive(Clone, Default)]
struct Recorded {
    calls: Arc<Mutex<Vec<String>>>,
    read_requests: Arc<Mutex<Vec<MarkMessagesReadRequest>>>,
}

impl Recorded {
    fn push(&self, call: String) {
        self.calls.lock().expect("calls").push(call);
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("calls").clone()
    }
}

async fn spawn_backend() -> (String, Recorded) {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let recorded = Recorded::default();

    let app = Router::new()
        .route(
            "/api/messages/conversations/:identity",
            get(
                |State(rec): State<Recorded>, Path(identity): Path<String>| async move {
                    rec.push(format!("GET conversations {identity}"));
                    Json(vec![conversation_record("c1", &[identity.as_str(), "doc-1"], 1)])
                },
            ),
        )
        .route(
            "/api/messages/user/:identity",
            get(
                |State(rec): State<Recorded>, Path(identity): Path<String>| async move {
                    rec.push(format!("GET messages {identity}"));
                    Json(vec![message_record("m1", "c1", "doc-1", &identity, 1, false)])
                },
            ),
        )
        .route(
            "/api/messages/conversation/:conversation_id",
            get(
                |State(rec): State<Recorded>, Path(conversation_id): Path<String>| async move {
                    rec.push(format!("GET conversation {conversation_id}"));
                    Json(vec![
                        message_record("m1", &conversation_id, "doc-1", "pat-1", 1, true),
                        message_record("m2", &conversation_id, "pat-1", "doc-1", 2, false),
                    ])
                },
            ),
        )
        .route(
            "/api/messages",
            post(
                |State(rec): State<Recorded>, Json(request): Json<SendMessageRequest>| async move {
                    rec.push(format!("POST message to {}", request.receiver_id));
                    let mut record = message_record(
                        "srv-1",
                        "c1",
                        request.sender_id.as_str(),
                        request.receiver_id.as_str(),
                        7,
                        false,
                    );
                    record.content = request.content;
                    (StatusCode::CREATED, Json(record))
                },
            ),
        )
        .route(
            "/api/messages/read",
            patch(
                |State(rec): State<Recorded>, Json(request): Json<MarkMessagesReadRequest>| async move {
                    rec.push("PATCH messages read".to_string());
                    rec.read_requests.lock().expect("reads").push(request);
                    StatusCode::NO_CONTENT
                },
            ),
        )
        .route(
            "/api/notifications",
            post(
                |State(rec): State<Recorded>, Json(request): Json<CreateNotificationRequest>| async move {
                    rec.push(format!("POST notification {}", request.id));
                    let mut record = notification_record(
                        request.id.as_str(),
                        request.user_id.as_str(),
                        9,
                        false,
                    );
                    record.title = request.title;
                    record.kind = request.kind;
                    Json(record)
                },
            ),
        )
        .route(
            "/api/notifications/:id",
            get(
                |State(rec): State<Recorded>, Path(identity): Path<String>| async move {
                    rec.push(format!("GET notifications {identity}"));
                    Json(vec![notification_record("n1", &identity, 1, false)])
                },
            )
            .delete(
                |State(rec): State<Recorded>, Path(id): Path<String>| async move {
                    rec.push(format!("DELETE notification {id}"));
                    StatusCode::NO_CONTENT
                },
            ),
        )
        .route(
            "/api/notifications/:id/read",
            patch(
                |State(rec): State<Recorded>, Path(id): Path<String>| async move {
                    rec.push(format!("PATCH notification read {id}"));
                    StatusCode::OK
                },
            ),
        )
        .route(
            "/api/notifications/read-all/:identity",
            patch(
                |State(rec): State<Recorded>, Path(identity): Path<String>| async move {
                    rec.push(format!("PATCH notifications read-all {identity}"));
                    StatusCode::OK
                },
            ),
        )
        .with_state(recorded.clone());

    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (format!("http://{addr}/api"), recorded)
}

async fn spawn_failing_backend(status: StatusCode, body: Option<ApiError>) -> String {
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let app = Router::new().fallback(move || {
        let body = body.clone();
        async move {
            match body {
                Some(body) => (status, Json(body)).into_response(),
                None => status.into_response(),
            }
        }
    });
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{addr}/api/")
}

fn backend(base: &str) -> HttpBackend {
    HttpBackend::new(base, Duration::from_secs(5)).expect("client")
}

#[tokio::test]
async fn fetches_snapshot_resources() {
    let (base, recorded) = spawn_backend().await;
    let api = backend(&base);
    let identity = user("pat-1");

    let conversations = api.list_conversations(&identity).await.expect("conversations");
    let messages = api.list_messages(&identity).await.expect("messages");
    let page = api
        .list_conversation_messages(&ConversationId::from("c7"))
        .await
        .expect("page");
    let notifications = api.list_notifications(&identity).await.expect("notifications");

    assert_eq!(conversations.len(), 1);
    assert!(conversations[0].participants.contains(&identity));
    assert_eq!(messages[0].receiver_id, identity);
    assert_eq!(page.len(), 2);
    assert!(page.iter().all(|record| record.conversation_id.as_str() == "c7"));
    assert_eq!(notifications[0].user_id, identity);
    assert_eq!(
        recorded.calls(),
        vec![
            "GET conversations pat-1",
            "GET messages pat-1",
            "GET conversation c7",
            "GET notifications pat-1",
        ]
    );
}

#[tokio::test]
async fn posts_mutations_to_their_endpoints() {
    let (base, recorded) = spawn_backend().await;
    let api = backend(&base);

    let sent = api
        .send_message(&SendMessageRequest {
            sender_id: user("pat-1"),
            receiver_id: user("doc-1"),
            content: "Is Tuesday fine?".into(),
        })
        .await
        .expect("send");
    assert_eq!(sent.id.as_str(), "srv-1");
    assert_eq!(sent.content, "Is Tuesday fine?");

    api.mark_messages_read(&MarkMessagesReadRequest {
        conversation_id: ConversationId::from("c1"),
        message_id: None,
        user_id: user("pat-1"),
    })
    .await
    .expect("mark read");

    let created = api
        .create_notification(&CreateNotificationRequest {
            id: NotificationId::from("n-new"),
            user_id: user("pat-1"),
            title: "Lab results ready".into(),
            message: "Your results are available".into(),
            kind: NotificationKind::Success,
            related_entity: None,
        })
        .await
        .expect("create notification");
    assert_eq!(created.id.as_str(), "n-new");
    assert_eq!(created.kind, NotificationKind::Success);

    api.mark_notification_read(&NotificationId::from("n1"))
        .await
        .expect("mark notification");
    api.mark_all_notifications_read(&user("pat-1"))
        .await
        .expect("mark all");
    api.remove_notification(&NotificationId::from("n1"))
        .await
        .expect("remove");

    assert_eq!(
        recorded.calls(),
        vec![
            "POST message to doc-1",
            "PATCH messages read",
            "POST notification n-new",
            "PATCH notification read n1",
            "PATCH notifications read-all pat-1",
            "DELETE notification n1",
        ]
    );
    let reads = recorded.read_requests.lock().expect("reads").clone();
    assert_eq!(reads.len(), 1);
    assert_eq!(reads[0].conversation_id.as_str(), "c1");
    assert!(reads[0].message_id.is_none());
}

#[tokio::test]
async fn surfaces_structured_api_errors() {
    let base = spawn_failing_backend(
        StatusCode::FORBIDDEN,
        Some(ApiError::new(ErrorCode::Forbidden, "not your inbox")),
    )
    .await;
    let api = backend(&base);

    let err = api
        .list_messages(&user("pat-1"))
        .await
        .expect_err("forbidden");
    match err {
        SyncError::Request { endpoint, message } => {
            assert_eq!(endpoint, "/messages/user/pat-1");
            assert!(message.contains("not your inbox"), "{message}");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn reports_bare_status_when_body_is_empty() {
    let base = spawn_failing_backend(StatusCode::INTERNAL_SERVER_ERROR, None).await;
    let api = backend(&base);

    let err = api
        .remove_notification(&NotificationId::from("n1"))
        .await
        .expect_err("server error");
    assert!(err.to_string().contains("500"), "{err}");
    assert!(!err.is_transport());
}

#[tokio::test]
async fn unreachable_backend_is_a_request_error() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    drop(listener);
    std::env::set_var("NO_PROXY", "127.0.0.1,localhost");
    let api = backend(&format!("http://{addr}/api"));

    let err = api
        .list_notifications(&user("pat-1"))
        .await
        .expect_err("connection refused");
    assert!(matches!(err, SyncError::Request { .. }));
}
