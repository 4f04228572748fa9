use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{MySql, Pool};

use crate::dl::DlSyncRwLock;
use crate::models::{Chair, Id, Ride, RideStatus, RideStatusEnum, User};
use crate::{Coordinate, HashMap};

use super::{cache_init::CacheInit, Repository, Result};

#[allow(clippy::module_inception)]
mod ride;
mod status;
pub use status::deferred::RideStatusDeferrable;

pub type RideCache = Arc<RideCacheInner>;

/// Everything the ride state machine touches. Split so the matcher only
/// ever needs to read `waiting_rides`, and the notification pollers only
/// ever need their own per-entity queue.
#[derive(Debug)]
pub struct RideCacheInner {
    ride_cache: DlSyncRwLock<HashMap<Id<Ride>, Arc<RideEntry>>>,

    user_has_ride: DlSyncRwLock<HashMap<Id<User>, AtomicBool>>,
    user_rides: DlSyncRwLock<HashMap<Id<User>, DlSyncRwLock<Vec<Arc<RideEntry>>>>>,

    user_notification: DlSyncRwLock<HashMap<Id<User>, DlSyncRwLock<NotificationQueue>>>,
    chair_notification: DlSyncRwLock<HashMap<Id<Chair>, DlSyncRwLock<NotificationQueue>>>,

    /// Rides currently sitting in MATCHING, oldest first. The matcher pops
    /// from the front on every tick.
    waiting_rides: DlSyncRwLock<VecDeque<(Arc<RideEntry>, Id<RideStatus>)>>,

    ride_deferred: super::deferred::UpdatableDeferred<ride::RideDeferred>,
    status_deferred: super::deferred::UpdatableDeferred<status::deferred::RideStatusDeferrable>,
}

impl Repository {
    pub(super) fn init_ride_cache(pool: &Pool<MySql>, init: &mut CacheInit) -> RideCache {
        init.rides.sort_unstable_by_key(|x| x.created_at);
        init.ride_statuses.sort_unstable_by_key(|x| x.created_at);

        let mut statuses_by_ride: HashMap<Id<Ride>, Vec<RideStatus>> = HashMap::default();
        for status in &init.ride_statuses {
            statuses_by_ride
                .entry(status.ride_id)
                .or_insert_with(Vec::new)
                .push(status.clone());
        }

        let mut user_has_ride = HashMap::default();
        let mut user_rides: HashMap<Id<User>, DlSyncRwLock<Vec<Arc<RideEntry>>>> =
            HashMap::default();
        let mut user_notification = HashMap::default();
        for user in &init.users {
            user_has_ride.insert(user.id, AtomicBool::new(false));
            user_rides.insert(user.id, DlSyncRwLock::new(Vec::new()));
            user_notification.insert(user.id, DlSyncRwLock::new(NotificationQueue::new()));
        }

        let mut chair_notification = HashMap::default();
        for chair in &init.chairs {
            chair_notification.insert(chair.id, DlSyncRwLock::new(NotificationQueue::new()));
        }

        let mut ride_cache = HashMap::default();
        let mut waiting_rides = VecDeque::new();

        for ride in &init.rides {
            let sts = statuses_by_ride.get(&ride.id).cloned().unwrap_or_default();
            let latest = sts.last().map(|x| x.status).unwrap_or(RideStatusEnum::Matching);

            let entry = Arc::new(RideEntry {
                id: ride.id,
                user_id: ride.user_id,
                pickup: ride.pickup_coord(),
                destination: ride.destination_coord(),
                created_at: ride.created_at,
                chair_id: DlSyncRwLock::new(ride.chair_id),
                evaluation: DlSyncRwLock::new(ride.evaluation),
                updated_at: DlSyncRwLock::new(ride.updated_at),
                latest_status: DlSyncRwLock::new(latest),
            });

            for st in &sts {
                let b = NotificationBody {
                    ride_id: ride.id,
                    ride_status_id: st.id,
                    status: st.status,
                };
                user_notification
                    .get(&ride.user_id)
                    .unwrap()
                    .write()
                    .push(b.clone(), st.app_sent_at.is_some());

                if let Some(chair_id) = ride.chair_id {
                    if st.status == RideStatusEnum::Enroute {
                        chair_notification
                            .get(&chair_id)
                            .unwrap()
                            .write()
                            .push(b.clone(), st.chair_sent_at.is_some());
                    }
                }
            }

            if latest == RideStatusEnum::Matching {
                let status_id = sts.last().map(|x| x.id).unwrap_or_else(Id::new);
                waiting_rides.push_back((Arc::clone(&entry), status_id));
            }

            if !matches!(latest, RideStatusEnum::Completed) {
                user_has_ride
                    .get(&ride.user_id)
                    .unwrap()
                    .store(true, Ordering::Relaxed);
            }

            user_rides
                .get(&ride.user_id)
                .unwrap()
                .write()
                .push(Arc::clone(&entry));

            ride_cache.insert(ride.id, entry);
        }

        for rides in user_rides.values() {
            rides.write().sort_unstable_by_key(|r| r.created_at);
        }

        Arc::new(RideCacheInner {
            ride_cache: DlSyncRwLock::new(ride_cache),
            user_has_ride: DlSyncRwLock::new(user_has_ride),
            user_rides: DlSyncRwLock::new(user_rides),
            user_notification: DlSyncRwLock::new(user_notification),
            chair_notification: DlSyncRwLock::new(chair_notification),
            waiting_rides: DlSyncRwLock::new(waiting_rides),
            ride_deferred: super::deferred::UpdatableDeferred::new(pool),
            status_deferred: super::deferred::UpdatableDeferred::new(pool),
        })
    }
}

impl Repository {
    /// Snapshot of rides still in MATCHING, oldest first. The matcher builds
    /// its bipartite graph from this on every tick; it never mutates the
    /// queue directly, since a ride may get assigned to a chair it didn't
    /// even consider by the time the tick finishes.
    pub fn rides_waiting_snapshot(&self) -> Vec<(Arc<RideEntry>, Id<RideStatus>)> {
        self.ride_cache.waiting_rides.read().iter().cloned().collect()
    }

    pub fn rides_waiting_remove(&self, ride_id: Id<Ride>) {
        self.ride_cache
            .waiting_rides
            .write()
            .retain(|(r, _)| r.id != ride_id);
    }
}

impl RideCacheInner {
    pub fn on_user_add(&self, id: Id<User>) {
        self.user_has_ride.write().insert(id, AtomicBool::new(false));
        self.user_rides.write().insert(id, DlSyncRwLock::new(Vec::new()));
        self.user_notification
            .write()
            .insert(id, DlSyncRwLock::new(NotificationQueue::new()));
    }
    pub fn on_chair_add(&self, id: Id<Chair>) {
        self.chair_notification
            .write()
            .insert(id, DlSyncRwLock::new(NotificationQueue::new()));
    }
}

impl Repository {
    pub async fn chair_get_next_notification(
        &self,
        id: Id<Chair>,
    ) -> Result<Option<NotificationBody>> {
        let next = {
            let cache = self.ride_cache.chair_notification.read();
            let mut queue = cache.get(&id).unwrap().write();
            let Some(next) = queue.get_next() else {
                return Ok(None);
            };
            next
        };
        if !next.sent {
            self.ride_status_chair_notified(next.body.ride_status_id);
        }
        Ok(Some(next.body))
    }

    pub async fn app_get_next_notification(
        &self,
        id: Id<User>,
    ) -> Result<Option<NotificationBody>> {
        let next = {
            let cache = self.ride_cache.user_notification.read();
            let mut queue = cache.get(&id).unwrap().write();
            let Some(next) = queue.get_next() else {
                return Ok(None);
            };
            next
        };
        if !next.sent {
            self.ride_status_app_notified(next.body.ride_status_id);
        }
        Ok(Some(next.body))
    }
}

#[derive(Debug)]
pub struct NotificationQueue {
    last_sent: Option<NotificationBody>,
    queue: VecDeque<NotificationBody>,
}

impl NotificationQueue {
    fn new() -> Self {
        Self {
            last_sent: None,
            queue: VecDeque::new(),
        }
    }

    /// `sent` is only ever `true` during warm-load replay, to seed
    /// `last_sent` from a historical `*_sent_at` column. Live pushes are
    /// always unsent; a notification only counts as sent once a poller
    /// actually pulls it via [`NotificationQueue::get_next`].
    pub fn push(&mut self, b: NotificationBody, sent: bool) {
        if sent {
            if !self.queue.is_empty() {
                tracing::warn!("bug? sent notification after not-sent one; discarding queue");
                self.queue.clear();
            }
            self.last_sent = Some(b);
            return;
        }
        self.queue.push_back(b);
    }

    pub fn get_next(&mut self) -> Option<NotificationEntry> {
        if self.queue.is_empty() {
            let last = self.last_sent.clone();
            return last.map(|body| NotificationEntry { sent: true, body });
        }
        let e = self.queue.pop_front().unwrap();
        self.last_sent = Some(e.clone());
        Some(NotificationEntry {
            sent: false,
            body: e,
        })
    }
}

#[derive(Debug, Clone)]
pub struct NotificationEntry {
    sent: bool,
    body: NotificationBody,
}

#[derive(Debug, Clone)]
pub struct NotificationBody {
    pub ride_id: Id<Ride>,
    pub ride_status_id: Id<RideStatus>,
    pub status: RideStatusEnum,
}

#[derive(Debug)]
pub struct RideEntry {
    pub id: Id<Ride>,
    pub user_id: Id<User>,
    pub pickup: Coordinate,
    pub destination: Coordinate,
    pub created_at: DateTime<Utc>,

    pub chair_id: DlSyncRwLock<Option<Id<Chair>>>,
    pub evaluation: DlSyncRwLock<Option<i32>>,
    pub updated_at: DlSyncRwLock<DateTime<Utc>>,
    pub latest_status: DlSyncRwLock<RideStatusEnum>,
}
impl RideEntry {
    pub fn ride(&self) -> Ride {
        Ride {
            id: self.id,
            user_id: self.user_id,
            chair_id: *self.chair_id.read(),
            pickup_latitude: self.pickup.latitude,
            pickup_longitude: self.pickup.longitude,
            destination_latitude: self.destination.latitude,
            destination_longitude: self.destination.longitude,
            evaluation: *self.evaluation.read(),
            created_at: self.created_at,
            updated_at: *self.updated_at.read(),
        }
    }
    pub fn set_chair_id(&self, chair_id: Id<Chair>, now: DateTime<Utc>) {
        *self.chair_id.write() = Some(chair_id);
        *self.updated_at.write() = now;
    }
    pub fn set_evaluation(&self, eval: i32, now: DateTime<Utc>) {
        *self.evaluation.write() = Some(eval);
        *self.updated_at.write() = now;
    }
}
