use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive};
use axum::response::Sse;
use axum_extra::extract::cookie::Cookie;
use axum_extra::extract::CookieJar;
use futures::Stream;

use crate::models::{Id, Owner, Ride, RideStatusEnum, Symbol, User};
use crate::repo::ride::NotificationBody;
use crate::repo::EffortlessChair;
use crate::{AppState, Coordinate, Error};

pub fn chair_routes(app_state: AppState) -> axum::Router<AppState> {
    let routes =
        axum::Router::new().route("/api/chair/chairs", axum::routing::post(chair_post_chairs));

    let authed_routes = axum::Router::new()
        .route(
            "/api/chair/activity",
            axum::routing::post(chair_post_activity),
        )
        .route(
            "/api/chair/coordinate",
            axum::routing::post(chair_post_coordinate),
        )
        .route(
            "/api/chair/notification",
            axum::routing::get(chair_get_notification),
        )
        .route(
            "/api/chair/rides/:ride_id/status",
            axum::routing::post(chair_post_ride_status),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            app_state.clone(),
            crate::middlewares::chair_auth_middleware,
        ));

    routes.merge(authed_routes)
}

#[derive(Debug, serde::Deserialize)]
struct ChairPostChairsRequest {
    name: String,
    model: String,
    chair_register_token: String,
}

#[derive(Debug, serde::Serialize)]
struct ChairPostChairsResponse {
    id: Id<crate::models::Chair>,
    owner_id: Id<Owner>,
}

async fn chair_post_chairs(
    State(state): State<AppState>,
    jar: CookieJar,
    axum::Json(req): axum::Json<ChairPostChairsRequest>,
) -> Result<(CookieJar, (StatusCode, axum::Json<ChairPostChairsResponse>)), Error> {
    let repo = &state.repo;

    let Some(owner): Option<Owner> =
        repo.owner_get_by_chair_register_token(Symbol::new_from_ref(&req.chair_register_token))?
    else {
        return Err(Error::Unauthorized("invalid chair_register_token"));
    };

    let chair_id = Id::new();
    let access_token = crate::secure_random_str(32);

    repo.chair_add(
        chair_id,
        owner.id,
        Symbol::new_from(req.name.clone()),
        Symbol::new_from(req.model.clone()),
        false,
        Symbol::new_from(access_token.clone()),
    )?;

    let jar = jar.add(Cookie::build(("chair_session", access_token)).path("/"));

    Ok((
        jar,
        (
            StatusCode::CREATED,
            axum::Json(ChairPostChairsResponse {
                id: chair_id,
                owner_id: owner.id,
            }),
        ),
    ))
}

#[derive(Debug, serde::Deserialize)]
struct PostChairActivityRequest {
    is_active: bool,
}

async fn chair_post_activity(
    State(state): State<AppState>,
    axum::Extension(chair): axum::Extension<EffortlessChair>,
    axum::Json(req): axum::Json<PostChairActivityRequest>,
) -> Result<StatusCode, Error> {
    state.repo.chair_update_is_active(chair.id, req.is_active)?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, serde::Serialize)]
struct ChairPostCoordinateResponse {
    recorded_at: i64,
}

/// Posted coordinates alone drive status transitions: `chair_location_update`
/// compares against the movement target set by [`crate::matcher`] and
/// [`crate::repo::ride::status`] when the chair is ENROUTE/CARRYING, and
/// fires the PICKUP/ARRIVED transition itself when the chair reaches it.
async fn chair_post_coordinate(
    State(state): State<AppState>,
    axum::Extension(chair): axum::Extension<EffortlessChair>,
    axum::Json(req): axum::Json<Coordinate>,
) -> Result<axum::Json<ChairPostCoordinateResponse>, Error> {
    let created_at = state.repo.chair_location_update(chair.id, req)?;

    Ok(axum::Json(ChairPostCoordinateResponse {
        recorded_at: created_at.timestamp_millis(),
    }))
}

#[derive(Debug, serde::Serialize)]
struct SimpleUser {
    id: Id<User>,
    name: String,
}

#[derive(Debug, serde::Serialize)]
struct ChairGetNotificationResponseData {
    ride_id: Id<Ride>,
    user: SimpleUser,
    pickup_coordinate: Coordinate,
    destination_coordinate: Coordinate,
    status: RideStatusEnum,
}

const NOTIFICATION_POLL_INTERVAL: Duration = Duration::from_millis(250);

async fn chair_get_notification(
    State(state): State<AppState>,
    axum::Extension(chair): axum::Extension<EffortlessChair>,
) -> Sse<impl Stream<Item = Result<Event, Error>>> {
    let stream = futures::stream::unfold((state, chair.id), |(state, chair_id)| async move {
        loop {
            let next = match state.repo.chair_get_next_notification(chair_id).await {
                Ok(n) => n,
                Err(e) => return Some((Err(e), (state, chair_id))),
            };
            match chair_get_notification_body(&state, next).await {
                Ok(Some(data)) => {
                    let ev = Event::default().data(serde_json::to_string(&data).unwrap());
                    return Some((Ok(ev), (state, chair_id)));
                }
                Ok(None) => {
                    tokio::time::sleep(NOTIFICATION_POLL_INTERVAL).await;
                    continue;
                }
                Err(e) => return Some((Err(e), (state, chair_id))),
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn chair_get_notification_body(
    state: &AppState,
    body: Option<NotificationBody>,
) -> Result<Option<ChairGetNotificationResponseData>, Error> {
    let Some(body) = body else { return Ok(None) };
    let repo = &state.repo;

    let ride = repo.ride_get(body.ride_id)?.unwrap();
    let user = repo.user_get_by_id(ride.user_id)?.unwrap();

    Ok(Some(ChairGetNotificationResponseData {
        ride_id: ride.id,
        user: SimpleUser {
            id: user.id,
            name: format!("{} {}", user.firstname.resolve(), user.lastname.resolve()),
        },
        pickup_coordinate: ride.pickup_coord(),
        destination_coordinate: ride.destination_coord(),
        status: body.status,
    }))
}

#[derive(Debug, serde::Deserialize)]
struct PostChairRidesRideIDStatusRequest {
    status: RideStatusEnum,
}

async fn chair_post_ride_status(
    State(state): State<AppState>,
    axum::Extension(chair): axum::Extension<EffortlessChair>,
    Path((ride_id,)): Path<(Id<Ride>,)>,
    axum::Json(req): axum::Json<PostChairRidesRideIDStatusRequest>,
) -> Result<StatusCode, Error> {
    let repo = &state.repo;

    let Some(ride) = repo.ride_get(ride_id)? else {
        return Err(Error::NotFound("rides not found"));
    };

    if ride.chair_id.is_none_or(|chair_id| chair_id != chair.id) {
        return Err(Error::BadRequest("not assigned to this ride"));
    }

    let next = match req.status {
        // Acknowledge the ride
        RideStatusEnum::Enroute => RideStatusEnum::Enroute,
        // After picking up the user
        RideStatusEnum::Carrying => {
            let status = repo.ride_status_latest(ride.id)?;
            if status != RideStatusEnum::Pickup {
                return Err(Error::BadRequest("chair has not arrived yet"));
            }
            RideStatusEnum::Carrying
        }
        _ => {
            return Err(Error::BadRequest("invalid status"));
        }
    };

    repo.ride_status_update(ride_id, next)?;

    Ok(StatusCode::NO_CONTENT)
}
