use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum_extra::extract::cookie::Cookie;
use axum_extra::extract::CookieJar;
use chrono::{DateTime, NaiveDate, Utc};

use crate::models::{Chair, Id, Owner, Symbol};
use crate::{AppState, Error, HashMap};

pub fn owner_routes(app_state: AppState) -> axum::Router<AppState> {
    let routes =
        axum::Router::new().route("/api/owner/owners", axum::routing::post(owner_post_owners));

    let authed_routes = axum::Router::new()
        .route("/api/owner/sales", axum::routing::get(owner_get_sales))
        .route("/api/owner/chairs", axum::routing::get(owner_get_chairs))
        .route_layer(axum::middleware::from_fn_with_state(
            app_state.clone(),
            crate::middlewares::owner_auth_middleware,
        ));

    routes.merge(authed_routes)
}

#[derive(Debug, serde::Deserialize)]
struct OwnerPostOwnersRequest {
    name: String,
}

#[derive(Debug, serde::Serialize)]
struct OwnerPostOwnersResponse {
    id: Id<Owner>,
    chair_register_token: String,
}

async fn owner_post_owners(
    State(state): State<AppState>,
    jar: CookieJar,
    axum::Json(req): axum::Json<OwnerPostOwnersRequest>,
) -> Result<(CookieJar, (StatusCode, axum::Json<OwnerPostOwnersResponse>)), Error> {
    let owner_id = Id::new();
    let access_token = crate::secure_random_str(8);
    let chair_register_token = crate::secure_random_str(8);

    state.repo.owner_add(
        owner_id,
        Symbol::new_from(req.name),
        Symbol::new_from(access_token.clone()),
        Symbol::new_from(chair_register_token.clone()),
    )?;

    let jar = jar.add(Cookie::build(("owner_session", access_token)).path("/"));

    Ok((
        jar,
        (
            StatusCode::CREATED,
            axum::Json(OwnerPostOwnersResponse {
                id: owner_id,
                chair_register_token,
            }),
        ),
    ))
}

#[derive(Debug, serde::Deserialize)]
struct OwnerGetSalesQuery {
    since: Option<i64>,
    until: Option<i64>,
}

#[derive(Debug, serde::Serialize)]
struct OwnerGetSalesResponse {
    total_sales: i32,
    chairs: Vec<ChairSales>,
    models: Vec<ModelSales>,
}

#[derive(Debug, serde::Serialize)]
struct ChairSales {
    id: Id<Chair>,
    name: String,
    sales: i32,
}

#[derive(Debug, serde::Serialize)]
struct ModelSales {
    model: String,
    sales: i32,
}

async fn owner_get_sales(
    State(state): State<AppState>,
    axum::Extension(owner): axum::Extension<Owner>,
    Query(query): Query<OwnerGetSalesQuery>,
) -> Result<axum::Json<OwnerGetSalesResponse>, Error> {
    let since = if let Some(since) = query.since {
        DateTime::from_timestamp_millis(since).unwrap()
    } else {
        DateTime::from_timestamp_millis(0).unwrap()
    };
    let until = if let Some(until) = query.until {
        DateTime::from_timestamp_millis(until).unwrap()
    } else {
        DateTime::from_naive_utc_and_offset(
            NaiveDate::from_ymd_opt(9999, 12, 31)
                .unwrap()
                .and_hms_opt(23, 59, 59)
                .unwrap(),
            Utc,
        )
    };

    let mut res = OwnerGetSalesResponse {
        total_sales: 0,
        chairs: Vec::new(),
        models: Vec::new(),
    };

    let mut model_sales_by_model: HashMap<Symbol, i32> = HashMap::default();

    for chair in state.repo.chair_sale_stats_by_owner(owner.id, since, until)? {
        res.total_sales += chair.sales;
        *model_sales_by_model.entry(chair.model).or_insert(0) += chair.sales;
        res.chairs.push(ChairSales {
            id: chair.id,
            name: chair.name.resolve().to_owned(),
            sales: chair.sales,
        });
    }

    for (model, sales) in model_sales_by_model {
        res.models.push(ModelSales {
            model: model.resolve().to_owned(),
            sales,
        });
    }

    Ok(axum::Json(res))
}

#[derive(Debug, serde::Serialize)]
struct OwnerGetChairsResponse {
    chairs: Vec<OwnerGetChairsResponseChair>,
}

#[derive(Debug, serde::Serialize)]
struct OwnerGetChairsResponseChair {
    id: Id<Chair>,
    name: String,
    model: String,
    active: bool,
    registered_at: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    total_distance_updated_at: Option<i64>,
    total_distance: i64,
}

async fn owner_get_chairs(
    State(state): State<AppState>,
    axum::Extension(owner): axum::Extension<Owner>,
) -> Result<axum::Json<OwnerGetChairsResponse>, Error> {
    let repo = &state.repo;
    let chairs = repo.chair_get_by_owner(owner.id)?;

    let mut res = vec![];
    for chair in chairs {
        let (total_distance, total_distance_updated_at) = repo
            .chair_total_distance(chair.id)?
            .map(|x| (x.0, Some(x.1.timestamp_millis())))
            .unwrap_or((0, None));

        res.push(OwnerGetChairsResponseChair {
            id: chair.id,
            name: chair.name.resolve().to_owned(),
            model: chair.model.resolve().to_owned(),
            active: chair.is_active,
            registered_at: chair.created_at.timestamp_millis(),
            total_distance,
            total_distance_updated_at,
        })
    }

    Ok(axum::Json(OwnerGetChairsResponse { chairs: res }))
}
