//! E2E tests for the ActivityPub endpoints

mod common;

use axum::http::StatusCode;
use common::{MockRemote, OWNER_API_KEY, TestServer, follow_and_drain};

#[tokio::test]
async fn test_actor_document() {
    let server = TestServer::new().await;

    let response = server.client.get(server.url("/~alice")).send().await.unwrap();

    assert_eq!(response.status(), 200);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("application/activity+json"));

    let actor: serde_json::Value = response.json().await.unwrap();
    let id = server.actor_id();
    assert_eq!(actor["id"], id);
    assert_eq!(actor["type"], "Person");
    assert_eq!(actor["preferredUsername"], "alice");
    assert_eq!(actor["inbox"], format!("{id}/inbox"));
    assert_eq!(actor["outbox"], format!("{id}/outbox"));
    assert_eq!(actor["publicKey"]["id"], format!("{id}#main-key"));
    assert!(
        actor["publicKey"]["publicKeyPem"]
            .as_str()
            .unwrap()
            .starts_with("-----BEGIN PUBLIC KEY-----")
    );
}

#[tokio::test]
async fn test_unknown_or_unprefixed_user_is_404() {
    let server = TestServer::new().await;

    for path in ["/~nobody", "/alice", "/~nobody/outbox", "/~nobody/followers"] {
        let response = server.client.get(server.url(path)).send().await.unwrap();
        assert_eq!(response.status(), 404, "{path}");
    }
}

#[tokio::test]
async fn test_duplicate_inbox_delivery_is_accepted_once() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    let follow = remote.follow("bob", &server.actor_id(), 1);
    let inbox = server.url("/~alice/inbox");

    let first = remote.post_signed(&server.client, &inbox, "bob", &follow).await;
    let second = remote.post_signed(&server.client, &inbox, "bob", &follow).await;

    assert_eq!(first.status(), StatusCode::CREATED);
    assert_eq!(second.status(), StatusCode::ACCEPTED);
    assert_eq!(server.jobs().await.len(), 1);
}

#[tokio::test]
async fn test_inbox_rejects_bad_signatures() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    let follow = remote.follow("bob", &server.actor_id(), 1);

    // Unsigned
    let response = server
        .client
        .post(server.url("/~alice/inbox"))
        .json(&follow)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Signed by a different actor than the one claimed
    let response = remote
        .post_signed(&server.client, &server.url("/~alice/inbox"), "mallory", &follow)
        .await;
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Body altered after signing
    let body = serde_json::to_vec(&follow).unwrap();
    let mut request = server
        .client
        .post(server.url("/~alice/inbox"))
        .body(body.clone())
        .build()
        .unwrap();
    fedipost::federation::sign_request(
        &mut request,
        &remote.key_id("bob"),
        &remote.private_key_pem(),
        &body,
    )
    .unwrap();
    let mut tampered = follow.clone();
    tampered["object"] = serde_json::json!("http://elsewhere.example/~eve");
    *request.body_mut() = Some(serde_json::to_vec(&tampered).unwrap().into());
    let response = server.client.execute(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    assert!(server.jobs().await.is_empty());
}

#[tokio::test]
async fn test_inbox_requires_actor() {
    let server = TestServer::new().await;

    let response = server
        .client
        .post(server.url("/~alice/inbox"))
        .json(&serde_json::json!({
            "id": "http://remote.example/follows/1",
            "type": "Follow",
            "object": server.actor_id()
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let error: serde_json::Value = response.json().await.unwrap();
    assert_eq!(error["code"], 400);
}

#[tokio::test]
async fn test_publish_requires_owner_api_key() {
    let server = TestServer::new().await;
    let note = serde_json::json!({
        "@context": "https://www.w3.org/ns/activitystreams",
        "type": "Note",
        "content": "hi"
    });

    let response = server
        .client
        .post(server.url("/~alice/outbox"))
        .json(&note)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = server
        .client
        .post(server.url("/~alice/outbox"))
        .bearer_auth("owner.wrong-value")
        .json(&note)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // A valid key that belongs to someone else
    let carol = server
        .state
        .identity
        .create_user(&fedipost::identity::NewUser {
            username: "carol".to_string(),
            email: "carol@localhost".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    server
        .state
        .identity
        .upsert_api_key(&carol.id, "carol", "carol-secret")
        .await
        .unwrap();
    let response = server
        .client
        .post(server.url("/~alice/outbox"))
        .bearer_auth("carol.carol-secret")
        .json(&note)
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn test_publish_validates_note() {
    let server = TestServer::new().await;

    for body in [
        serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Article",
            "content": "hi"
        }),
        serde_json::json!({"type": "Note", "content": "no context"}),
        serde_json::json!({
            "@context": "https://w3id.org/security/v1",
            "type": "Note",
            "content": "wrong context"
        }),
    ] {
        let response = server
            .client
            .post(server.url("/~alice/outbox"))
            .bearer_auth(OWNER_API_KEY)
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNPROCESSABLE_ENTITY, "{body}");
    }
}

#[tokio::test]
async fn test_outbox_lists_only_public_notes() {
    let server = TestServer::new().await;
    server.publish_note("first").await;
    let private = server
        .client
        .post(server.url("/~alice/outbox"))
        .bearer_auth(OWNER_API_KEY)
        .json(&serde_json::json!({
            "@context": "https://www.w3.org/ns/activitystreams",
            "type": "Note",
            "content": "followers only",
            "to": [format!("{}/followers", server.actor_id())]
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(private.status(), StatusCode::CREATED);
    server.publish_note("second").await;

    let outbox: serde_json::Value = server
        .client
        .get(server.url("/~alice/outbox"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(outbox["type"], "OrderedCollection");
    assert_eq!(outbox["id"], format!("{}/outbox", server.actor_id()));
    assert_eq!(outbox["totalItems"], 2);
    let contents: Vec<&str> = outbox["orderedItems"]
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["object"]["content"].as_str().unwrap())
        .collect();
    assert_eq!(contents, vec!["second", "first"]);
}

#[tokio::test]
async fn test_followers_and_following_collections() {
    let server = TestServer::new().await;
    let remote = MockRemote::start().await;
    follow_and_drain(&server, &remote, "bob", 1).await;

    let followers: serde_json::Value = server
        .client
        .get(server.url("/~alice/followers"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(followers["totalItems"], 1);
    assert_eq!(followers["orderedItems"][0], remote.actor_id("bob"));

    let following: serde_json::Value = server
        .client
        .get(server.url("/~alice/following"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(following["totalItems"], 0);
    assert!(following.get("orderedItems").is_none());
}

#[tokio::test]
async fn test_published_note_is_dereferenceable() {
    let server = TestServer::new().await;
    let activity: serde_json::Value = server.publish_note("look at me").await.json().await.unwrap();
    let note_id = activity["object"]["id"].as_str().unwrap();
    let path = note_id.strip_prefix(&server.addr).unwrap();

    let response = server.client.get(server.url(path)).send().await.unwrap();
    assert_eq!(response.status(), 200);
    let note: serde_json::Value = response.json().await.unwrap();
    assert_eq!(note["id"], note_id);
    assert_eq!(note["type"], "Note");
    assert_eq!(note["content"], "look at me");

    let missing = server
        .client
        .get(server.url("/~alice/notes/01ARZ3NDEKTSV4RRFFQ69G5FAV"))
        .send()
        .await
        .unwrap();
    assert_eq!(missing.status(), 404);
}
