use crate::{
    dl::DlSyncRwLock,
    models::{Ride, RideStatusEnum},
    ConcurrentSymbolMap, HashMap,
};

use chrono::{DateTime, Utc};
use sqlx::{MySql, Transaction};
use std::sync::Arc;

use crate::{
    models::{Chair, ChairLocation, Id},
    Coordinate,
};

use crate::repo::{
    cache_init::CacheInit,
    deferred::{DeferrableSimple, SimpleDeferred},
    Repository, Result,
};

pub(super) struct ChairLocationDeferrable;
impl DeferrableSimple for ChairLocationDeferrable {
    const NAME: &str = "chair_locations";

    type Insert = ChairLocation;

    async fn exec_insert(tx: &mut Transaction<'static, MySql>, inserts: &[Self::Insert]) {
        let mut query = sqlx::QueryBuilder::new(
            "insert into chair_locations(id, chair_id, latitude, longitude, created_at) ",
        );
        query.push_values(inserts, |mut b, e: &ChairLocation| {
            b.push_bind(&e.id)
                .push_bind(e.chair_id)
                .push_bind(e.latitude)
                .push_bind(e.longitude)
                .push_bind(e.created_at);
        });
        query.build().execute(&mut **tx).await.unwrap();
    }
}

/// Per-chair running position: latest coordinate, cumulative Manhattan
/// distance travelled, and (while the chair is working a ride) the target
/// coordinate at which it should auto-transition to the next status.
#[derive(Debug)]
pub struct LocationCache {
    inner: DlSyncRwLock<Option<EntryInner>>,
}
impl LocationCache {
    pub fn new() -> Self {
        Self {
            inner: DlSyncRwLock::new(None),
        }
    }
    pub fn update(
        &self,
        coord: Coordinate,
        at: DateTime<Utc>,
    ) -> Option<(Id<Ride>, RideStatusEnum)> {
        let mut cache = self.inner.write();
        match cache.as_mut() {
            Some(d) => d.update(coord, at),
            None => {
                *cache = Some(EntryInner::new(coord, at));
                None
            }
        }
    }
    pub fn set_movement(&self, coord: Coordinate, next: RideStatusEnum, ride: Id<Ride>) {
        let mut c = self.inner.write();
        c.as_mut().unwrap().set_movement(coord, next, ride);
    }
    pub fn latest(&self) -> Option<Coordinate> {
        Some(self.inner.read().as_ref()?.latest_coord)
    }
    pub fn get_total(&self) -> Option<(i64, DateTime<Utc>)> {
        let e = self.inner.read();
        let e = e.as_ref()?;
        Some((e.total, e.updated_at))
    }
    pub fn clear_movement(&self) {
        self.inner.write().as_mut().unwrap().clear_movement();
    }
}

#[derive(Debug)]
struct EntryInner {
    latest_coord: Coordinate,
    updated_at: DateTime<Utc>,
    total: i64,
    movement: Option<(Coordinate, RideStatusEnum /* next */, Id<Ride>)>,
}

impl EntryInner {
    fn new(coord: Coordinate, at: DateTime<Utc>) -> Self {
        Self {
            latest_coord: coord,
            updated_at: at,
            total: 0,
            movement: None,
        }
    }
    fn update(
        &mut self,
        coord: Coordinate,
        at: DateTime<Utc>,
    ) -> Option<(Id<Ride>, RideStatusEnum)> {
        self.total += self.latest_coord.distance(coord) as i64;
        self.latest_coord = coord;
        self.updated_at = at;

        if self.movement.as_ref().is_some_and(|x| x.0 == coord) {
            let (_c, r, i) = self.movement.take().unwrap();
            return Some((i, r));
        }

        None
    }
    fn set_movement(&mut self, coord: Coordinate, next: RideStatusEnum, ride: Id<Ride>) {
        self.movement = Some((coord, next, ride));
    }
    fn clear_movement(&mut self) {
        self.movement = None;
    }
}

pub type ChairLocationCache = Arc<ChairLocationCacheInner>;

#[derive(Debug)]
pub struct ChairLocationCacheInner {
    cache: ConcurrentSymbolMap<Id<Chair>, Arc<LocationCache>>,
    deferred: SimpleDeferred<ChairLocationDeferrable>,
}
impl ChairLocationCacheInner {
    fn entry(&self, id: Id<Chair>) -> Arc<LocationCache> {
        Arc::clone(
            &self
                .cache
                .entry(id)
                .or_insert_with(|| Arc::new(LocationCache::new())),
        )
    }
}

struct ChairLocationCacheInit {
    cache: HashMap<Id<Chair>, Arc<LocationCache>>,
}
impl ChairLocationCacheInit {
    fn from_init(init: &mut CacheInit) -> Self {
        init.locations.sort_unstable_by_key(|x| x.created_at);

        let mut res: HashMap<Id<Chair>, Arc<LocationCache>> = HashMap::default();
        for loc in &init.locations {
            let c = res
                .entry(loc.chair_id)
                .or_insert_with(|| Arc::new(LocationCache::new()));
            c.update(loc.coord(), loc.created_at);
        }

        init.rides.sort_unstable_by_key(|x| x.created_at);
        init.ride_statuses.sort_unstable_by_key(|x| x.created_at);

        let mut statuses: HashMap<_, Vec<_>> = HashMap::default();
        for status in &init.ride_statuses {
            statuses.entry(status.ride_id).or_default().push(status.clone());
        }

        for ride in &init.rides {
            let Some(chair_id) = ride.chair_id else {
                continue;
            };
            let Some(sts) = statuses.get(&ride.id) else {
                continue;
            };
            for status in sts {
                match status.status {
                    RideStatusEnum::Matching => {}
                    RideStatusEnum::Enroute => {
                        let loc_entry = res.get_mut(&chair_id).unwrap();
                        loc_entry.set_movement(ride.pickup_coord(), RideStatusEnum::Pickup, ride.id);
                    }
                    RideStatusEnum::Pickup => {
                        let loc_entry = res.get_mut(&chair_id).unwrap();
                        loc_entry.clear_movement();
                    }
                    RideStatusEnum::Carrying => {
                        let loc_entry = res.get_mut(&chair_id).unwrap();
                        loc_entry.set_movement(
                            ride.destination_coord(),
                            RideStatusEnum::Arrived,
                            ride.id,
                        );
                    }
                    RideStatusEnum::Arrived => {
                        let loc_entry = res.get_mut(&chair_id).unwrap();
                        loc_entry.clear_movement();
                    }
                    RideStatusEnum::Completed => {}
                    RideStatusEnum::Canceled => unreachable!(),
                }
            }
        }

        Self { cache: res }
    }
}

impl Repository {
    pub(super) fn init_chair_location_cache(
        pool: &sqlx::Pool<MySql>,
        init: &mut CacheInit,
    ) -> ChairLocationCache {
        let init = ChairLocationCacheInit::from_init(init);
        let cache = ConcurrentSymbolMap::default();
        for (id, loc) in init.cache {
            cache.insert(id, loc);
        }
        Arc::new(ChairLocationCacheInner {
            cache,
            deferred: SimpleDeferred::new(pool),
        })
    }
    pub(super) fn reinit_chair_location_cache(&self, init: &mut CacheInit) {
        let init = ChairLocationCacheInit::from_init(init);
        self.chair_location_cache.cache.clear();
        for (id, loc) in init.cache {
            self.chair_location_cache.cache.insert(id, loc);
        }
    }
}

impl Repository {
    pub fn chair_location_get_latest(&self, id: Id<Chair>) -> Result<Option<Coordinate>> {
        let Some(cache) = self.chair_location_cache.cache.get(&id) else {
            return Ok(None);
        };
        Ok(cache.latest())
    }

    pub fn chair_total_distance(
        &self,
        chair_id: Id<Chair>,
    ) -> Result<Option<(i64, DateTime<Utc>)>> {
        let Some(cache) = self.chair_location_cache.cache.get(&chair_id) else {
            return Ok(None);
        };
        Ok(cache.get_total())
    }

    pub fn chair_set_movement(
        &self,
        chair_id: Id<Chair>,
        coord: Coordinate,
        next: RideStatusEnum,
        ride: Id<Ride>,
    ) {
        let cache = self.chair_location_cache.entry(chair_id);
        cache.set_movement(coord, next, ride);
    }

    pub fn chair_clear_movement(&self, chair_id: Id<Chair>) {
        let cache = self.chair_location_cache.entry(chair_id);
        cache.clear_movement();
    }

    pub fn chair_location_update(
        &self,
        chair_id: Id<Chair>,
        coord: Coordinate,
    ) -> Result<DateTime<Utc>> {
        let created_at = Utc::now();

        let c = ChairLocation {
            id: ulid::Ulid::new().to_string(),
            chair_id,
            latitude: coord.latitude,
            longitude: coord.longitude,
            created_at,
        };

        self.chair_location_cache.deferred.insert(c);

        let update = self.chair_location_cache.entry(chair_id).update(coord, created_at);

        if let Some((ride, status)) = update {
            self.ride_status_update(ride, status)?;
        }

        Ok(created_at)
    }
}
