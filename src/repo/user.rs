use crate::dl::DlSyncRwLock;
use crate::HashMap;
use std::sync::Arc;

use chrono::Utc;
use sqlx::{MySql, Pool, QueryBuilder};

use crate::models::{Id, InvitationCode, Symbol, User};

use super::{
    cache_init::CacheInit,
    deferred::{DeferrableSimple, SimpleDeferred},
    Repository, Result,
};

pub type UserCache = Arc<UserCacheInner>;
type SharedUser = Arc<User>;

#[derive(Debug)]
pub struct UserCacheInner {
    by_id: DlSyncRwLock<HashMap<Id<User>, SharedUser>>,
    by_token: DlSyncRwLock<HashMap<Symbol, SharedUser>>,
    by_inv_code: DlSyncRwLock<HashMap<InvitationCode, SharedUser>>,
    deferred: SimpleDeferred<UserDeferrable>,
}

impl UserCacheInner {
    fn push(&self, u: User) {
        let s = Arc::new(u.clone());

        let mut id = self.by_id.write();
        let mut t = self.by_token.write();
        let mut inv = self.by_inv_code.write();
        id.insert(u.id, Arc::clone(&s));
        t.insert(u.access_token, Arc::clone(&s));
        inv.insert(u.invitation_code, Arc::clone(&s));
    }
}

struct UserCacheInit {
    by_id: HashMap<Id<User>, SharedUser>,
    by_token: HashMap<Symbol, SharedUser>,
    by_inv_code: HashMap<InvitationCode, SharedUser>,
}
impl UserCacheInit {
    fn from_init(init: &mut CacheInit) -> Self {
        let mut id = HashMap::default();
        let mut t = HashMap::default();
        let mut inv = HashMap::default();
        for user in &init.users {
            let user = Arc::new(user.clone());
            id.insert(user.id, Arc::clone(&user));
            t.insert(user.access_token, Arc::clone(&user));
            inv.insert(user.invitation_code, Arc::clone(&user));
        }
        Self {
            by_id: id,
            by_token: t,
            by_inv_code: inv,
        }
    }
}

impl Repository {
    pub(super) fn init_user_cache(pool: &Pool<MySql>, init: &mut CacheInit) -> UserCache {
        let init = UserCacheInit::from_init(init);

        Arc::new(UserCacheInner {
            by_id: DlSyncRwLock::new(init.by_id),
            by_token: DlSyncRwLock::new(init.by_token),
            by_inv_code: DlSyncRwLock::new(init.by_inv_code),
            deferred: SimpleDeferred::new(pool),
        })
    }
    pub(super) fn reinit_user_cache(&self, init: &mut CacheInit) {
        let init = UserCacheInit::from_init(init);

        let UserCacheInner {
            by_id,
            by_token,
            by_inv_code,
            deferred: _,
        } = &*self.user_cache;
        let mut id = by_id.write();
        let mut t = by_token.write();
        let mut inv = by_inv_code.write();

        *id = init.by_id;
        *t = init.by_token;
        *inv = init.by_inv_code;
    }
}

impl Repository {
    pub fn user_get_by_access_token(&self, token: Symbol) -> Result<Option<User>> {
        let cache = self.user_cache.by_token.read();
        let Some(entry) = cache.get(&token) else {
            return Ok(None);
        };
        Ok(Some(User::clone(entry)))
    }
    pub fn user_get_by_id(&self, id: Id<User>) -> Result<Option<User>> {
        let cache = self.user_cache.by_id.read();
        let Some(entry) = cache.get(&id) else {
            return Ok(None);
        };
        Ok(Some(User::clone(entry)))
    }
    pub fn user_get_by_inv_code(&self, code: InvitationCode) -> Result<Option<User>> {
        let cache = self.user_cache.by_inv_code.read();
        let Some(entry) = cache.get(&code) else {
            return Ok(None);
        };
        Ok(Some(User::clone(entry)))
    }

    #[allow(clippy::too_many_arguments)]
    pub fn user_add(
        &self,
        id: Id<User>,
        username: Symbol,
        first: Symbol,
        last: Symbol,
        dob: Symbol,
        token: Symbol,
        inv_code: InvitationCode,
    ) -> Result<()> {
        let now = Utc::now();

        let u = User {
            id,
            username,
            firstname: first,
            lastname: last,
            date_of_birth: dob,
            access_token: token,
            invitation_code: inv_code,
            created_at: now,
            updated_at: now,
        };
        self.user_cache.push(u.clone());
        self.user_cache.deferred.insert(u);
        self.ride_cache.on_user_add(id);
        Ok(())
    }
}

struct UserDeferrable;
impl DeferrableSimple for UserDeferrable {
    const NAME: &str = "users";

    type Insert = User;

    async fn exec_insert(tx: &mut sqlx::Transaction<'static, MySql>, inserts: &[Self::Insert]) {
        let mut builder = QueryBuilder::new(
            "insert into users
                (id, username, firstname, lastname, date_of_birth, access_token, invitation_code, created_at, updated_at) ",
        );
        builder.push_values(inserts, |mut b, i| {
            b.push_bind(i.id)
                .push_bind(i.username)
                .push_bind(i.firstname)
                .push_bind(i.lastname)
                .push_bind(i.date_of_birth)
                .push_bind(i.access_token)
                .push_bind(i.invitation_code)
                .push_bind(i.created_at)
                .push_bind(i.updated_at);
        });
        builder.build().execute(&mut **tx).await.unwrap();
    }
}
