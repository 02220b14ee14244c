//! Subcommand implementations.

use std::sync::Arc;

use miette::Result;
use tracing::{debug, info, warn};

use ideaboard_store::{
    CacheError, CurrentUser, Idea, IdeaCache, IdeaCacheBuilder, IdeaId, IdentityProvider,
    XrpcStore,
};

use crate::Connection;

/// A signed-in session with a cache over the board's collection.
pub struct Board {
    store: Arc<XrpcStore>,
    cache: Arc<IdeaCache>,
    user: CurrentUser,
}

impl Board {
    /// Sign in and prepare the cache.
    pub async fn connect(conn: &Connection) -> Result<Self> {
        let store = Arc::new(XrpcStore::new(&conn.pds_url));
        let user = store
            .sign_in(&conn.handle, &conn.app_password)
            .await
            .map_err(|e| miette::miette!("{}", e))?;

        let cache = IdeaCacheBuilder::new(store.clone())
            .collection(&conn.collection)
            .sync_policy(conn.sync_policy)
            .build();

        let mut loading = cache.loading();
        tokio::spawn(async move {
            while loading.changed().await.is_ok() {
                debug!(busy = *loading.borrow_and_update(), "board busy flag changed");
            }
        });

        info!(
            collection = %cache.collection(),
            policy = %cache.policy(),
            "board ready"
        );

        Ok(Self { store, cache, user })
    }

    /// End the session, ignoring failures.
    pub async fn close(&self) {
        if let Err(e) = self.store.sign_out().await {
            warn!(error = %e, "failed to sign out");
        }
    }

    async fn find(&self, id: &str) -> Result<Idea> {
        self.cache.fetch_all().await.map_err(report)?;
        let id = IdeaId::from(id);
        self.cache
            .get(&id)
            .ok_or_else(|| report(CacheError::NotFound { id }))
    }

    pub async fn list(&self, json: bool) -> Result<()> {
        let ideas = self.cache.fetch_all().await.map_err(report)?;

        if json {
            let out = serde_json::to_string_pretty(ideas.as_slice())
                .map_err(|e| miette::miette!("failed to encode ideas: {}", e))?;
            println!("{out}");
            return Ok(());
        }

        if ideas.is_empty() {
            println!("No ideas yet.");
            return Ok(());
        }

        for idea in ideas.iter() {
            let tags = if idea.tags.is_empty() {
                String::new()
            } else {
                format!(
                    " [{}]",
                    idea.tags.iter().cloned().collect::<Vec<_>>().join(", ")
                )
            };
            println!(
                "{:>4}  {}  {}{}  ({})",
                idea.votes,
                idea.id,
                idea.title,
                tags,
                idea.display_name.as_deref().unwrap_or("anonymous"),
            );
        }
        Ok(())
    }

    pub async fn add(&self, title: String, description: String, tags: Vec<String>) -> Result<()> {
        let idea = Idea::new(title, description, tags, &self.user);
        let handle = self.cache.add(&idea).await.map_err(report)?;
        println!("Added {} ({})", idea.id, handle);
        Ok(())
    }

    pub async fn vote(&self, id: &str) -> Result<()> {
        let idea = self.find(id).await?.upvote();
        self.cache.update(&idea).await.map_err(report)?;
        println!("{} now has {} votes", idea.id, idea.votes);
        Ok(())
    }

    pub async fn edit(
        &self,
        id: &str,
        title: Option<String>,
        description: Option<String>,
        tags: Vec<String>,
    ) -> Result<()> {
        let mut idea = self.find(id).await?;
        if let Some(title) = title {
            idea.title = title;
        }
        if let Some(description) = description {
            idea.description = description;
        }
        if !tags.is_empty() {
            idea.tags = tags.into_iter().collect();
        }

        self.cache.update(&idea).await.map_err(report)?;
        println!("Updated {}", idea.id);
        Ok(())
    }

    pub async fn remove(&self, id: &str) -> Result<()> {
        let idea = self.find(id).await?;
        self.cache.remove(&idea).await.map_err(report)?;
        println!("Removed {}", idea.id);
        Ok(())
    }

    pub fn whoami(&self) -> Result<()> {
        println!("{} ({})", self.user.handle, self.user.did);
        if let Some(name) = &self.user.display_name {
            println!("Display name: {name}");
        }
        if let Some(photo) = &self.user.photo_url {
            println!("Avatar: {photo}");
        }
        Ok(())
    }

    pub async fn delete_account(&self, password: &str, token: &str) -> Result<()> {
        self.store
            .delete_account(password, token)
            .await
            .map_err(|e| miette::miette!("failed to delete account: {}", e))?;
        println!("Deleted account {}", self.user.handle);
        Ok(())
    }
}

fn report(err: CacheError) -> miette::Report {
    match &err {
        CacheError::RefreshFailed { .. } => {
            miette::miette!("{} (run `ideaboard list` to reload)", err)
        }
        _ => miette::miette!("{}", err),
    }
}
