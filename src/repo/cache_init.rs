use sqlx::{MySql, Pool};

use crate::models::{Chair, ChairLocation, Coupon, Owner, PaymentToken, Ride, RideStatus, User};

/// Everything the in-memory caches need to rebuild themselves from MySQL,
/// loaded once up front at `/api/initialize` (and process start) so each
/// cache's own init code can just slice the vectors it cares about instead
/// of issuing its own query.
pub struct CacheInit {
    pub chairs: Vec<Chair>,
    pub owners: Vec<Owner>,
    pub users: Vec<User>,
    pub rides: Vec<Ride>,
    pub ride_statuses: Vec<RideStatus>,
    pub locations: Vec<ChairLocation>,
    pub pt: Vec<PaymentToken>,
    pub coupon: Vec<Coupon>,
}

impl CacheInit {
    pub async fn load(pool: &Pool<MySql>) -> Self {
        let (chairs, owners, users, rides, ride_statuses, locations, pt, coupon) = tokio::join!(
            Self::fetch::<Chair>(pool, "select * from chairs"),
            Self::fetch::<Owner>(pool, "select * from owners"),
            Self::fetch::<User>(pool, "select * from users"),
            Self::fetch::<Ride>(pool, "select * from rides"),
            Self::fetch::<RideStatus>(pool, "select * from ride_statuses"),
            Self::fetch::<ChairLocation>(pool, "select * from chair_locations"),
            Self::fetch::<PaymentToken>(pool, "select * from payment_tokens"),
            Self::fetch::<Coupon>(pool, "select * from coupons"),
        );

        Self {
            chairs,
            owners,
            users,
            rides,
            ride_statuses,
            locations,
            pt,
            coupon,
        }
    }

    async fn fetch<T>(pool: &Pool<MySql>, query: &str) -> Vec<T>
    where
        T: for<'r> sqlx::FromRow<'r, sqlx::mysql::MySqlRow> + Send + Unpin,
    {
        sqlx::query_as(query).fetch_all(pool).await.unwrap()
    }
}
