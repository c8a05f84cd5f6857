//! Minimal portico example: a notes service with bearer auth and CORS.
//!
//! Run with:
//!   NOTES_API_VERSION=1.4 cargo run --example notes
//!
//! Try:
//!   curl -i http://localhost:3000/notes
//!   curl -i -X POST http://localhost:3000/notes \
//!        -H 'authorization: Bearer demo-token' \
//!        -H 'content-type: application/json' \
//!        -d '{"title":"groceries"}'
//!   curl -i -X POST http://localhost:3000/notes -H 'content-type: text/plain' -d 'hi'
//!   curl -i -X OPTIONS http://localhost:3000/notes \
//!        -H 'origin: http://localhost:5173' -H 'access-control-request-method: POST'

use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use portico::{
    Actor, Application, ApplicationOptions, BearerAuthenticator, CachingActorsRegistry, Interrupt, Method,
    Outcome, Rejection, RequestContext, Router, Server, ServiceResponse, StatusCode,
};
use serde_json::{Value, json};

type Notes = Arc<Mutex<Vec<Value>>>;

#[tokio::main]
async fn main() -> Result<(), portico::Error> {
    tracing_subscriber::fmt::init();

    let notes = Notes::default();
    let (list, create) = (Arc::clone(&notes), notes);

    let router = Router::new()
        .on(Method::GET, "/notes", move |_ctx: RequestContext| list_notes(Arc::clone(&list)))
        .on(Method::POST, "/notes", move |ctx: RequestContext| create_note(Arc::clone(&create), ctx));

    let options = ApplicationOptions::builder()
        .api_version_from_env("NOTES_API_VERSION")
        .allowed_origins("http://localhost:5173")
        .idle_timeout(Duration::from_secs(10))
        .build();

    // Verified tokens are remembered for a minute, at most 1024 of them.
    let actors = CachingActorsRegistry::new(Duration::from_secs(60), NonZeroUsize::new(1024));
    let bearer = BearerAuthenticator::new("notes", verify_token).cached(actors);

    let app = Application::new(options, router).authenticator(bearer);
    Server::bind("0.0.0.0:3000").serve(app).await
}

// Stand-in for a call to an identity provider.
async fn verify_token(token: String) -> Result<Actor, Rejection> {
    tokio::time::sleep(Duration::from_millis(50)).await;
    match token.as_str() {
        "demo-token" => Ok(Actor::new("demo").with_scopes(["notes:write"])),
        "read-only" => Ok(Actor::new("viewer")),
        _ => Err(Rejection::InvalidCredentials),
    }
}

async fn list_notes(notes: Notes) -> Outcome<ServiceResponse> {
    let snapshot = notes.lock().map_err(|_| poisoned())?.clone();
    Ok(ServiceResponse::json(&snapshot)?)
}

fn poisoned() -> Interrupt {
    Interrupt::failure(anyhow::anyhow!("notes lock poisoned"))
}

// POST /notes: requires an actor with `notes:write` and a JSON body.
async fn create_note(notes: Notes, ctx: RequestContext) -> Outcome<ServiceResponse> {
    let Some(actor) = ctx.actor() else {
        return Err(ServiceResponse::error(StatusCode::UNAUTHORIZED, "sign in to write notes").into());
    };
    if !actor.has_scope("notes:write") {
        return Err(ServiceResponse::error(StatusCode::FORBIDDEN, "missing scope notes:write").into());
    }
    let Some(title) = ctx.entity().as_json().and_then(|v| v["title"].as_str()) else {
        return Err(ServiceResponse::error(StatusCode::BAD_REQUEST, "expected {\"title\": ...}").into());
    };

    let note = {
        let mut notes = notes.lock().map_err(|_| poisoned())?;
        let note = json!({ "id": notes.len() + 1, "title": title, "author": actor.principal() });
        notes.push(note.clone());
        note
    };

    let mut res = ServiceResponse::new(201)?;
    res.set_header("location", &format!("/notes/{}", note["id"]))?;
    res.set_json(&note)?;
    Ok(res)
}
