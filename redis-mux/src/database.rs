//! Per-database command helpers
//!
//! A [`Database`] borrows the multiplexer and stamps its index on every
//! command; switching happens on the shared connection with an internal
//! `SELECT` only when the index differs from the connection's current one.

use crate::command::{Command, CommandCode};
use crate::multiplexer::Multiplexer;
use bytes::Bytes;
use redis_mux_core::{error::RedisResult, value::RespValue};

/// A view of one logical database
#[derive(Debug, Clone, Copy)]
pub struct Database<'a> {
    mux: &'a Multiplexer,
    index: Option<u16>,
}

impl<'a> Database<'a> {
    pub(crate) const fn new(mux: &'a Multiplexer, index: Option<u16>) -> Self {
        Self { mux, index }
    }

    /// Database index; `None` means the configured default
    #[must_use]
    pub const fn index(&self) -> Option<u16> {
        self.index
    }

    fn scoped(&self, command: Command) -> Command {
        match (self.index, command.db()) {
            (Some(index), None) => command.with_db(index),
            _ => command,
        }
    }

    /// Execute any command in this database
    ///
    /// # Errors
    ///
    /// See [`Multiplexer::execute`].
    pub async fn execute(&self, command: Command) -> RedisResult<RespValue> {
        self.mux.execute(self.scoped(command)).await
    }

    /// Blocking [`Database::execute`]
    ///
    /// # Errors
    ///
    /// See [`Multiplexer::execute_blocking`].
    pub fn execute_blocking(&self, command: Command) -> RedisResult<RespValue> {
        self.mux.execute_blocking(self.scoped(command))
    }

    /// GET
    pub async fn get(&self, key: impl Into<Bytes>) -> RedisResult<Option<String>> {
        self.execute(Command::new(CommandCode::Get).key(key))
            .await?
            .as_optional_string()
    }

    /// SET
    pub async fn set(&self, key: impl Into<Bytes>, value: impl Into<Bytes>) -> RedisResult<()> {
        self.execute(Command::new(CommandCode::Set).key(key).arg(value))
            .await?;
        Ok(())
    }

    /// DEL; returns the number of keys removed
    pub async fn del<K, I>(&self, keys: I) -> RedisResult<i64>
    where
        K: Into<Bytes>,
        I: IntoIterator<Item = K>,
    {
        let command = keys
            .into_iter()
            .fold(Command::new(CommandCode::Del), |command, key| command.key(key));
        self.execute(command).await?.as_int()
    }

    /// EXISTS for one key
    pub async fn exists(&self, key: impl Into<Bytes>) -> RedisResult<bool> {
        let count = self
            .execute(Command::new(CommandCode::Exists).key(key))
            .await?
            .as_int()?;
        Ok(count > 0)
    }

    /// INCR
    pub async fn incr(&self, key: impl Into<Bytes>) -> RedisResult<i64> {
        self.execute(Command::new(CommandCode::Incr).key(key))
            .await?
            .as_int()
    }

    /// MGET; in a cluster every key must hash to the same slot
    pub async fn mget<K, I>(&self, keys: I) -> RedisResult<Vec<Option<String>>>
    where
        K: Into<Bytes>,
        I: IntoIterator<Item = K>,
    {
        let command = keys
            .into_iter()
            .fold(Command::new(CommandCode::Mget), |command, key| command.key(key));
        self.execute(command)
            .await?
            .as_array()?
            .iter()
            .map(RespValue::as_optional_string)
            .collect()
    }

    /// PUBLISH; returns the number of receivers
    pub async fn publish(
        &self,
        channel: impl Into<Bytes>,
        message: impl Into<Bytes>,
    ) -> RedisResult<i64> {
        self.execute(Command::new(CommandCode::Publish).arg(channel).arg(message))
            .await?
            .as_int()
    }

    /// PING
    pub async fn ping(&self) -> RedisResult<String> {
        self.execute(Command::new(CommandCode::Ping))
            .await?
            .as_string()
    }
}
