use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive};
use axum::response::Sse;
use axum_extra::extract::cookie::Cookie;
use axum_extra::extract::CookieJar;
use chrono::Utc;
use futures::Stream;

use crate::models::{
    Chair, Id, InvitationCode, Ride, RideStatusEnum, Symbol, User, COUPON_CP_NEW2024,
};
use crate::repo::ride::NotificationBody;
use crate::repo::Repository;
use crate::{AppState, Coordinate, Error};

pub fn app_routes(app_state: AppState) -> axum::Router<AppState> {
    let routes = axum::Router::new().route("/api/app/users", axum::routing::post(app_post_users));

    let authed_routes = axum::Router::new()
        .route(
            "/api/app/payment-methods",
            axum::routing::post(app_post_payment_methods),
        )
        .route(
            "/api/app/rides",
            axum::routing::get(app_get_rides).post(app_post_rides),
        )
        .route(
            "/api/app/rides/estimated-fare",
            axum::routing::post(app_post_rides_estimated_fare),
        )
        .route(
            "/api/app/rides/:ride_id/evaluation",
            axum::routing::post(app_post_ride_evaluation),
        )
        .route(
            "/api/app/notification",
            axum::routing::get(app_get_notification),
        )
        .route(
            "/api/app/nearby-chairs",
            axum::routing::get(app_get_nearby_chairs),
        )
        .route_layer(axum::middleware::from_fn_with_state(
            app_state.clone(),
            crate::middlewares::app_auth_middleware,
        ));

    routes.merge(authed_routes)
}

#[derive(Debug, serde::Deserialize)]
struct AppPostUsersRequest {
    username: String,
    firstname: String,
    lastname: String,
    date_of_birth: String,
    invitation_code: Option<String>,
}

#[derive(Debug, serde::Serialize)]
struct AppPostUsersResponse {
    id: Id<User>,
    invitation_code: String,
}

async fn app_post_users(
    State(state): State<AppState>,
    jar: CookieJar,
    axum::Json(req): axum::Json<AppPostUsersRequest>,
) -> Result<(CookieJar, (StatusCode, axum::Json<AppPostUsersResponse>)), Error> {
    let repo = &state.repo;

    let user_id = Id::new();
    let access_token = Symbol::new_from(crate::secure_random_str(32));
    let invitation_code = InvitationCode::new();

    repo.user_add(
        user_id,
        Symbol::new_from(req.username.clone()),
        Symbol::new_from(req.firstname.clone()),
        Symbol::new_from(req.lastname.clone()),
        Symbol::new_from(req.date_of_birth.clone()),
        access_token,
        invitation_code,
    )?;

    repo.coupon_add(user_id, *COUPON_CP_NEW2024, 3000).await?;

    if let Some(req_invitation_code) = req.invitation_code.as_ref() {
        if !req_invitation_code.is_empty() {
            let inv_code = InvitationCode::parse(req_invitation_code);

            let used = repo
                .coupon_get_count_by_code(inv_code.gen_for_invited())
                .await?;
            if used >= 3 {
                return Err(Error::BadRequest("この招待コードは使用できません。"));
            }

            let Some(inviter) = repo.user_get_by_inv_code(inv_code)? else {
                return Err(Error::BadRequest("この招待コードは使用できません。"));
            };

            repo.coupon_add(user_id, inv_code.gen_for_invited(), 1500)
                .await?;
            repo.coupon_add(inviter.id, inv_code.gen_for_reward(), 1000)
                .await?;
        }
    }

    let jar = jar.add(Cookie::build(("app_session", access_token.resolve())).path("/"));

    Ok((
        jar,
        (
            StatusCode::CREATED,
            axum::Json(AppPostUsersResponse {
                id: user_id,
                invitation_code: invitation_code.as_symbol().resolve().to_owned(),
            }),
        ),
    ))
}

#[derive(Debug, serde::Deserialize)]
struct AppPostPaymentMethodsRequest {
    token: String,
}

async fn app_post_payment_methods(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<User>,
    axum::Json(req): axum::Json<AppPostPaymentMethodsRequest>,
) -> Result<StatusCode, Error> {
    state
        .repo
        .payment_token_add(user.id, Symbol::new_from(req.token))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, serde::Serialize)]
struct GetAppRidesResponse {
    rides: Vec<GetAppRidesResponseItem>,
}

#[derive(Debug, serde::Serialize)]
struct GetAppRidesResponseItem {
    id: Id<Ride>,
    pickup_coordinate: Coordinate,
    destination_coordinate: Coordinate,
    chair: GetAppRidesResponseItemChair,
    fare: i32,
    evaluation: i32,
    requested_at: i64,
    completed_at: i64,
}

#[derive(Debug, serde::Serialize)]
struct GetAppRidesResponseItemChair {
    id: Id<Chair>,
    owner: String,
    name: String,
    model: String,
}

async fn app_get_rides(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<User>,
) -> Result<axum::Json<GetAppRidesResponse>, Error> {
    let repo = &state.repo;
    let rides = repo.rides_by_user(user.id)?;

    let mut items = Vec::with_capacity(rides.len());
    for ride in rides {
        if repo.ride_status_latest(ride.id)? != RideStatusEnum::Completed {
            continue;
        }

        let fare = discounted_fare_for_ride(repo, &ride).await?;

        let chair_id = ride.chair_id.unwrap();
        let chair = repo.chair_get_by_id_effortless(chair_id)?.unwrap();
        let owner = repo.owner_get_by_id(chair.owner_id)?.unwrap();

        items.push(GetAppRidesResponseItem {
            pickup_coordinate: ride.pickup_coord(),
            destination_coordinate: ride.destination_coord(),
            id: ride.id,
            chair: GetAppRidesResponseItemChair {
                id: chair.id,
                owner: owner.name.resolve().to_owned(),
                name: chair.name.resolve().to_owned(),
                model: chair.model.resolve().to_owned(),
            },
            fare,
            evaluation: ride.evaluation.unwrap(),
            requested_at: ride.created_at.timestamp_millis(),
            completed_at: ride.updated_at.timestamp_millis(),
        });
    }

    Ok(axum::Json(GetAppRidesResponse { rides: items }))
}

#[derive(Debug, serde::Deserialize)]
struct AppPostRidesRequest {
    pickup_coordinate: Coordinate,
    destination_coordinate: Coordinate,
}

#[derive(Debug, serde::Serialize)]
struct AppPostRidesResponse {
    ride_id: Id<Ride>,
    fare: i32,
}

async fn app_post_rides(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<User>,
    axum::Json(req): axum::Json<AppPostRidesRequest>,
) -> Result<(StatusCode, axum::Json<AppPostRidesResponse>), Error> {
    let repo = &state.repo;
    let ride_id = Id::new();

    if repo.rides_user_ongoing(user.id)? {
        return Err(Error::Conflict("ride already exists"));
    }

    repo.rides_new_and_set_matching(
        ride_id,
        user.id,
        req.pickup_coordinate,
        req.destination_coordinate,
    )?;

    // the oldest unused coupon is consumed automatically; the first-ride
    // campaign coupon was enqueued first so it naturally wins the ordering
    if let Some(coupon) = repo
        .coupon_get_unused_order_by_created_at(user.id)
        .await?
        .into_iter()
        .next()
    {
        repo.coupon_set_used(user.id, coupon.code, ride_id).await?;
    }

    let discount = repo
        .coupon_get_by_usedby(ride_id)
        .await?
        .map(|c| c.discount)
        .unwrap_or(0);
    let fare = crate::calculate_discounted_fare(
        req.pickup_coordinate,
        req.destination_coordinate,
        discount,
    );

    Ok((
        StatusCode::ACCEPTED,
        axum::Json(AppPostRidesResponse { ride_id, fare }),
    ))
}

#[derive(Debug, serde::Deserialize)]
struct AppPostRidesEstimatedFareRequest {
    pickup_coordinate: Coordinate,
    destination_coordinate: Coordinate,
}

#[derive(Debug, serde::Serialize)]
struct AppPostRidesEstimatedFareResponse {
    fare: i32,
    discount: i32,
}

async fn app_post_rides_estimated_fare(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<User>,
    axum::Json(req): axum::Json<AppPostRidesEstimatedFareRequest>,
) -> Result<axum::Json<AppPostRidesEstimatedFareResponse>, Error> {
    // peek-only: look at the oldest unused coupon without consuming it
    let discount = state
        .repo
        .coupon_get_unused_order_by_created_at(user.id)
        .await?
        .into_iter()
        .next()
        .map(|c| c.discount)
        .unwrap_or(0);

    let discounted = crate::calculate_discounted_fare(
        req.pickup_coordinate,
        req.destination_coordinate,
        discount,
    );

    Ok(axum::Json(AppPostRidesEstimatedFareResponse {
        fare: discounted,
        discount: crate::calculate_fare(req.pickup_coordinate, req.destination_coordinate)
            - discounted,
    }))
}

#[derive(Debug, serde::Deserialize)]
struct AppPostRideEvaluationRequest {
    evaluation: i32,
}

#[derive(Debug, serde::Serialize)]
struct AppPostRideEvaluationResponse {
    fare: i32,
    completed_at: i64,
}

async fn app_post_ride_evaluation(
    State(state): State<AppState>,
    Path((ride_id,)): Path<(Id<Ride>,)>,
    axum::Json(req): axum::Json<AppPostRideEvaluationRequest>,
) -> Result<axum::Json<AppPostRideEvaluationResponse>, Error> {
    if !(1..=5).contains(&req.evaluation) {
        return Err(Error::BadRequest("evaluation must be between 1 and 5"));
    }

    let repo = &state.repo;

    let Some(ride) = repo.ride_get(ride_id)? else {
        return Err(Error::NotFound("ride not found"));
    };

    if repo.ride_status_latest(ride.id)? != RideStatusEnum::Arrived {
        return Err(Error::BadRequest("not arrived yet"));
    }

    let Some(payment_token) = repo.payment_token_get(ride.user_id)? else {
        return Err(Error::BadRequest("payment token not registered"));
    };

    let fare = discounted_fare_for_ride(repo, &ride).await?;

    let payment_gateway_url = repo.pgw_get()?;

    crate::payment_gateway::request_payment_gateway_post_payment(
        &state.client,
        &payment_gateway_url,
        payment_token.resolve(),
        ride_id.resolve(),
        &crate::payment_gateway::PaymentGatewayPostPaymentRequest { amount: fare },
    )
    .await?;

    let chair_id = ride.chair_id.unwrap();
    let updated_at = repo.rides_set_evaluation(ride_id, chair_id, req.evaluation)?;
    repo.ride_status_update(ride_id, RideStatusEnum::Completed)?;

    Ok(axum::Json(AppPostRideEvaluationResponse {
        fare,
        completed_at: updated_at.timestamp_millis(),
    }))
}

#[derive(Debug, serde::Serialize)]
struct AppGetNotificationResponseData {
    ride_id: Id<Ride>,
    pickup_coordinate: Coordinate,
    destination_coordinate: Coordinate,
    fare: i32,
    status: RideStatusEnum,
    #[serde(skip_serializing_if = "Option::is_none")]
    chair: Option<AppGetNotificationResponseChair>,
    created_at: i64,
    updated_at: i64,
}

#[derive(Debug, serde::Serialize)]
struct AppGetNotificationResponseChair {
    id: Id<Chair>,
    name: String,
    model: String,
    stats: ChairStats,
}

#[derive(Debug, serde::Serialize)]
pub struct ChairStats {
    pub total_rides_count: i32,
    pub total_evaluation_avg: f64,
}

const NOTIFICATION_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Polled rather than pushed through a broadcast channel:
/// [`crate::repo::ride::NotificationQueue`] hands back the same entry again
/// (marked already-sent) when nothing new has arrived, so a reconnecting
/// client always gets the current state instead of a gap.
async fn app_get_notification(
    State(state): State<AppState>,
    axum::Extension(user): axum::Extension<User>,
) -> Sse<impl Stream<Item = Result<Event, Error>>> {
    let stream = futures::stream::unfold((state, user.id), |(state, user_id)| async move {
        loop {
            let next = match state.repo.app_get_next_notification(user_id).await {
                Ok(n) => n,
                Err(e) => return Some((Err(e), (state, user_id))),
            };
            match app_get_notification_body(&state, next).await {
                Ok(Some(data)) => {
                    let ev = Event::default().data(serde_json::to_string(&data).unwrap());
                    return Some((Ok(ev), (state, user_id)));
                }
                Ok(None) => {
                    tokio::time::sleep(NOTIFICATION_POLL_INTERVAL).await;
                    continue;
                }
                Err(e) => return Some((Err(e), (state, user_id))),
            }
        }
    });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn app_get_notification_body(
    state: &AppState,
    body: Option<NotificationBody>,
) -> Result<Option<AppGetNotificationResponseData>, Error> {
    let Some(body) = body else { return Ok(None) };
    let repo = &state.repo;
    let ride = repo.ride_get(body.ride_id)?.unwrap();
    let status = body.status;

    let fare = discounted_fare_for_ride(repo, &ride).await?;

    let mut data = AppGetNotificationResponseData {
        pickup_coordinate: ride.pickup_coord(),
        destination_coordinate: ride.destination_coord(),
        ride_id: ride.id,
        fare,
        status,
        chair: None,
        created_at: ride.created_at.timestamp_millis(),
        updated_at: ride.updated_at.timestamp_millis(),
    };

    if let Some(chair_id) = ride.chair_id {
        let chair = repo.chair_get_by_id_effortless(chair_id)?.unwrap();
        let stats = repo.chair_get_stats(chair.id)?;

        data.chair = Some(AppGetNotificationResponseChair {
            id: chair.id,
            name: chair.name.resolve().to_owned(),
            model: chair.model.resolve().to_owned(),
            stats,
        });
    }

    Ok(Some(data))
}

#[derive(Debug, serde::Deserialize)]
struct AppGetNearbyChairsQuery {
    latitude: i32,
    longitude: i32,
    distance: Option<i32>,
}

#[derive(Debug, serde::Serialize)]
struct AppGetNearbyChairsResponse {
    chairs: Vec<AppGetNearbyChairsResponseChair>,
    retrieved_at: i64,
}

#[derive(Debug, serde::Serialize)]
pub struct AppGetNearbyChairsResponseChair {
    pub id: Id<Chair>,
    pub name: String,
    pub model: String,
    pub current_coordinate: Coordinate,
}

async fn app_get_nearby_chairs(
    State(state): State<AppState>,
    Query(query): Query<AppGetNearbyChairsQuery>,
) -> Result<axum::Json<AppGetNearbyChairsResponse>, Error> {
    let repo = &state.repo;
    let distance = query.distance.unwrap_or(50);
    let base = Coordinate {
        latitude: query.latitude,
        longitude: query.longitude,
    };

    let mut chairs = vec![];
    for chair_id in repo.chair_free_snapshot() {
        let Some(coord) = repo.chair_location_get_latest(chair_id)? else {
            continue;
        };
        if base.distance(coord) > distance {
            continue;
        }
        let Some(chair) = repo.chair_get_by_id_effortless(chair_id)? else {
            continue;
        };
        chairs.push(AppGetNearbyChairsResponseChair {
            id: chair.id,
            name: chair.name.resolve().to_owned(),
            model: chair.model.resolve().to_owned(),
            current_coordinate: coord,
        });
    }

    Ok(axum::Json(AppGetNearbyChairsResponse {
        chairs,
        retrieved_at: Utc::now().timestamp_millis(),
    }))
}

/// An already-matched coupon wins; otherwise fall back to the oldest unused
/// one so a fare shown before matching still reflects the discount the rider
/// will actually get.
async fn discounted_fare_for_ride(repo: &Repository, ride: &Ride) -> Result<i32, Error> {
    let discount = if let Some(c) = repo.coupon_get_by_usedby(ride.id).await? {
        c.discount
    } else {
        repo.coupon_get_unused_order_by_created_at(ride.user_id)
            .await?
            .into_iter()
            .next()
            .map(|c| c.discount)
            .unwrap_or(0)
    };

    Ok(crate::calculate_discounted_fare(
        ride.pickup_coord(),
        ride.destination_coord(),
        discount,
    ))
}
