mod cache_init;
mod chair;
pub mod coupon;
mod deferred;
mod location;
mod model;
mod owner;
mod payment_token;
mod pgw;
pub mod ride;
mod user;

use cache_init::CacheInit;
use chair::ChairCache;
pub use chair::EffortlessChair;
use coupon::CouponCache;
use location::ChairLocationCache;
use model::ChairModelCache;
use owner::OwnerCache;
use payment_token::PtCache;
use pgw::PgwCache;
use ride::RideCache;
use sqlx::{MySql, Pool};

use crate::Error;

pub type Tx = sqlx::Transaction<'static, MySql>;
type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct Repository {
    pool: Pool<MySql>,

    user_cache: UserCache,
    owner_cache: OwnerCache,
    chair_cache: ChairCache,
    chair_location_cache: ChairLocationCache,
    ride_cache: RideCache,
    pgw_cache: PgwCache,
    pt_cache: PtCache,
    coupon_cache: CouponCache,
    chair_model_cache: ChairModelCache,
}

use user::UserCache;

impl Repository {
    pub async fn new(pool: &Pool<MySql>) -> Self {
        let mut init = CacheInit::load(pool).await;

        Self {
            pool: pool.clone(),

            user_cache: Self::init_user_cache(pool, &mut init),
            owner_cache: Self::init_owner_cache(pool, &mut init),
            chair_cache: Self::init_chair_cache(pool, &mut init),
            ride_cache: Self::init_ride_cache(pool, &mut init),
            chair_location_cache: Self::init_chair_location_cache(pool, &mut init),
            pgw_cache: Self::init_pgw_cache(pool).await,
            pt_cache: Self::init_pt_cache(&mut init, pool),
            coupon_cache: Self::init_coupon_cache(&mut init).await,
            chair_model_cache: Self::init_chair_model_cache(pool).await,
        }
    }

    /// Re-hydrates every cache from the database. Called from the
    /// `/api/initialize` handler after the benchmark resets the schema, so
    /// in-memory state stays consistent with whatever the init script just
    /// loaded instead of restarting the whole process.
    pub async fn reinit(&self) {
        let mut init = CacheInit::load(&self.pool).await;

        self.reinit_user_cache(&mut init);
        self.reinit_owner_cache(&mut init);
        self.reinit_chair_cache(&mut init);
        self.reinit_chair_location_cache(&mut init);
        self.reinit_pt_cache(&mut init);
        self.reinit_coupon_cache(&mut init).await;
        self.reinit_chair_model_cache().await;
        self.reinit_pgw_cache(&self.pool).await;
    }

    pub fn pool(&self) -> &Pool<MySql> {
        &self.pool
    }
}
