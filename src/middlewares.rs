use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use axum_extra::extract::CookieJar;

use crate::models::{Owner, Symbol, User};
use crate::repo::EffortlessChair;
use crate::{AppState, Error};

pub async fn app_auth_middleware(
    State(state): State<AppState>,
    jar: CookieJar,
    mut req: Request,
    next: Next,
) -> Result<Response, Error> {
    let repo = &state.repo;
    let Some(c) = jar.get("app_session") else {
        return Err(Error::Unauthorized("app_session cookie is required"));
    };
    let access_token = Symbol::new_from_ref(c.value());
    let Some(user): Option<User> = repo.user_get_by_access_token(access_token)? else {
        return Err(Error::Unauthorized("invalid access token"));
    };

    req.extensions_mut().insert(user);

    Ok(next.run(req).await)
}

pub async fn owner_auth_middleware(
    State(state): State<AppState>,
    jar: CookieJar,
    mut req: Request,
    next: Next,
) -> Result<Response, Error> {
    let repo = &state.repo;
    let Some(c) = jar.get("owner_session") else {
        return Err(Error::Unauthorized("owner_session cookie is required"));
    };
    let access_token = Symbol::new_from_ref(c.value());
    let Some(owner): Option<Owner> = repo.owner_get_by_access_token(access_token)? else {
        return Err(Error::Unauthorized("invalid access token"));
    };

    req.extensions_mut().insert(owner);

    Ok(next.run(req).await)
}

pub async fn chair_auth_middleware(
    State(state): State<AppState>,
    jar: CookieJar,
    mut req: Request,
    next: Next,
) -> Result<Response, Error> {
    let repo = &state.repo;
    let Some(c) = jar.get("chair_session") else {
        return Err(Error::Unauthorized("chair_session cookie is required"));
    };
    let access_token = Symbol::new_from_ref(c.value());
    let Some(chair): Option<EffortlessChair> = repo.chair_get_by_access_token(access_token)?
    else {
        return Err(Error::Unauthorized("invalid access token"));
    };

    req.extensions_mut().insert(chair);

    Ok(next.run(req).await)
}

/// Measures handler latency and feeds it to the per-path aggregator in
/// [`crate::speed`]. A no-op pass-through when the `speed` feature is off.
pub async fn timing_middleware(
    State(_state): State<AppState>,
    req: Request,
    next: Next,
) -> Response {
    #[cfg(feature = "speed")]
    {
        let path = req.uri().path().to_owned();
        let start = std::time::Instant::now();
        let res = next.run(req).await;
        _state.speed.on_request(&path, start.elapsed()).await;
        res
    }
    #[cfg(not(feature = "speed"))]
    {
        next.run(req).await
    }
}
