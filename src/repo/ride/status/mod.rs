pub mod deferred;
use chrono::Utc;
use deferred::{NotifiedType, RideStatusUpdate};

use std::sync::Arc;

use crate::models::{Id, Ride, RideStatus, RideStatusEnum};
use crate::repo::{Repository, Result};

use super::NotificationBody;

// ride_status
impl Repository {
    pub fn ride_status_latest(&self, ride_id: Id<Ride>) -> Result<RideStatusEnum> {
        let cache = self.ride_cache.ride_cache.read();
        let ride = cache.get(&ride_id).unwrap();
        let s = *ride.latest_status.read();
        Ok(s)
    }

    // writes

    pub fn ride_status_update(&self, ride_id: Id<Ride>, status: RideStatusEnum) -> Result<()> {
        let status_id = Id::<RideStatus>::new();

        self.ride_cache.status_deferred.insert(RideStatus {
            id: status_id,
            ride_id,
            status,
            created_at: Utc::now(),
            app_sent_at: None,
            chair_sent_at: None,
        });

        let b = NotificationBody {
            ride_id,
            ride_status_id: status_id,
            status,
        };

        let ride = {
            let ride_cache = self.ride_cache.ride_cache.read();
            let ride = ride_cache.get(&ride_id).unwrap();
            Arc::clone(ride)
        };

        *ride.latest_status.write() = status;

        {
            let user = self.ride_cache.user_notification.read();
            user.get(&ride.user_id).unwrap().write().push(b.clone(), false);
        }

        let chair_id = *ride.chair_id.read();

        if let Some(c) = chair_id {
            {
                let chair = self.ride_cache.chair_notification.read();
                chair.get(&c).unwrap().write().push(b.clone(), false);
            }

            // Arms the one movement target `chair_location_update` actually
            // polls (`LocationCache::update`), so the next matching coordinate
            // post fires the auto PICKUP/ARRIVED transition. Mirrors the
            // replay order `ChairLocationCacheInit::from_init` reconstructs
            // at warm-load.
            match status {
                RideStatusEnum::Matching => {}
                RideStatusEnum::Enroute => {
                    self.chair_set_movement(c, ride.pickup, RideStatusEnum::Pickup, ride_id);
                }
                RideStatusEnum::Pickup => {
                    self.chair_clear_movement(c);
                }
                RideStatusEnum::Carrying => {
                    self.chair_set_movement(c, ride.destination, RideStatusEnum::Arrived, ride_id);
                }
                RideStatusEnum::Arrived => {
                    self.chair_clear_movement(c);
                }
                RideStatusEnum::Completed => {}
                RideStatusEnum::Canceled => unreachable!(), // not issued past matching
            }
        }

        if status == RideStatusEnum::Completed {
            self.ride_cache
                .user_has_ride
                .read()
                .get(&ride.user_id)
                .unwrap()
                .store(false, std::sync::atomic::Ordering::Relaxed);

            if let Some(c) = chair_id {
                let chair_cache = Arc::clone(&self.chair_cache);
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    chair_cache.push_free(c);
                });
            }
        }

        if status == RideStatusEnum::Matching {
            let mut waiting_rides = self.ride_cache.waiting_rides.write();
            waiting_rides.push_back((Arc::clone(&ride), status_id));
        }

        Ok(())
    }

    pub fn ride_status_chair_notified(&self, status_id: Id<RideStatus>) {
        self.ride_cache.status_deferred.update(RideStatusUpdate {
            ty: NotifiedType::Chair,
            status_id,
            at: Utc::now(),
        });
    }

    pub fn ride_status_app_notified(&self, status_id: Id<RideStatus>) {
        self.ride_cache.status_deferred.update(RideStatusUpdate {
            ty: NotifiedType::App,
            status_id,
            at: Utc::now(),
        });
    }
}
