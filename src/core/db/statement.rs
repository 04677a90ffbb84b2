/// Statement Cache Module
///
/// Prepared statements keyed by SQL text, scoped per transaction level. Each
/// transaction pushes a fresh frame and pops it on exit, so a statement
/// prepared inside a transaction is never handed out after it ends.
///
/// The cache decides what the driver keeps compiled. The driver holds one
/// compile per SQL text with a live handle, and every cache miss is exactly
/// one driver compile. Handles that go away without a driver at hand (a
/// cursor dropped after its transaction ended) are retired and their compiles
/// discarded on the next driver call.
use crate::core::db::driver::{Driver, DriverError, NativeResult};
use std::collections::HashMap;
use std::mem;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// Distinct SQL texts kept compiled unless configured otherwise.
pub const DEFAULT_STATEMENT_CAPACITY: usize = 64;

/// A logical statement handle.
///
/// While a handle is checked out it is absent from the cache, so a second
/// execution of the same SQL prepares its own handle instead of sharing
/// bound parameters with a live cursor.
#[derive(Debug)]
pub struct Statement {
    sql: String,
    frame: u64,
    generation: u64,
    last_used: u64,
    pending: Option<NativeResult>,
}

impl Statement {
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Whether the statement still carries unread results.
    pub fn has_open_cursor(&self) -> bool {
        self.pending.is_some()
    }

    pub(crate) fn attach(&mut self, result: NativeResult) {
        self.pending = Some(result);
    }

    pub(crate) fn take_result(&mut self) -> Option<NativeResult> {
        self.pending.take()
    }

    /// Discards unread results.
    pub fn close_cursor(&mut self) {
        self.pending = None;
    }
}

/// Counters for diagnostics and tests.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatementStats {
    /// Driver compiles, one per cache miss
    pub prepared: u64,
    /// Acquisitions served from the cache
    pub hits: u64,
}

#[derive(Debug)]
struct Frame {
    id: u64,
    statements: HashMap<String, Statement>,
}

#[derive(Debug)]
pub struct StatementCache {
    frames: Vec<Frame>,
    next_frame: u64,
    generation: u64,
    capacity: usize,
    native_capacity: usize,
    clock: u64,
    /// Handles per SQL text, cached at any level or checked out
    live: HashMap<String, usize>,
    /// SQL texts whose last handle went away
    retired: Vec<String>,
    stats: StatementStats,
}

impl Default for StatementCache {
    fn default() -> Self {
        StatementCache::new()
    }
}

impl StatementCache {
    pub fn new() -> Self {
        StatementCache::with_capacity(DEFAULT_STATEMENT_CAPACITY)
    }

    /// A cache keeping at most `capacity` distinct SQL texts compiled, not
    /// counting texts whose every handle is checked out.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        StatementCache {
            frames: vec![Frame {
                id: 0,
                statements: HashMap::new(),
            }],
            next_frame: 1,
            generation: 0,
            capacity,
            native_capacity: capacity,
            clock: 0,
            live: HashMap::new(),
            retired: Vec::new(),
            stats: StatementStats::default(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Compiled-statement capacity the driver must be configured with.
    pub fn native_capacity(&self) -> usize {
        self.native_capacity
    }

    fn current(&mut self) -> &mut Frame {
        if self.frames.is_empty() {
            self.frames.push(Frame {
                id: 0,
                statements: HashMap::new(),
            });
        }
        let last = self.frames.len() - 1;
        &mut self.frames[last]
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    /// Number of pushed transaction frames; 0 outside any transaction.
    pub fn depth(&self) -> usize {
        self.frames.len().saturating_sub(1)
    }

    /// Ensures a handle for `sql` is cached at the current level, compiling
    /// it with `driver` on a miss.
    pub fn acquire(&mut self, sql: &str, driver: &mut dyn Driver) -> Result<(), DriverError> {
        self.discard_retired(driver);
        let now = self.tick();
        if let Some(statement) = self.current().statements.get_mut(sql) {
            statement.last_used = now;
            self.stats.hits += 1;
            trace!("Statement cache hit: {}", sql);
            return Ok(());
        }

        let statement = self.compile(sql, driver)?;
        self.current().statements.insert(sql.to_string(), statement);
        Ok(())
    }

    /// Removes the handle for `sql` from the cache for exclusive use,
    /// compiling one on a miss. Return it with [`StatementCache::release`].
    pub fn checkout(
        &mut self,
        sql: &str,
        driver: &mut dyn Driver,
    ) -> Result<Statement, DriverError> {
        self.discard_retired(driver);
        let now = self.tick();
        if let Some(mut statement) = self.current().statements.remove(sql) {
            statement.last_used = now;
            self.stats.hits += 1;
            trace!("Statement checked out from cache: {}", sql);
            return Ok(statement);
        }
        self.compile(sql, driver)
    }

    /// Compiles a new handle. Handles for the same SQL share one driver
    /// compile, so an existing one is replaced rather than reused.
    fn compile(&mut self, sql: &str, driver: &mut dyn Driver) -> Result<Statement, DriverError> {
        if self.live.contains_key(sql) {
            driver.discard_statement(sql);
        } else {
            self.evict(driver);
            if self.live.len() >= self.native_capacity {
                self.native_capacity = self.live.len() + 1;
                debug!("Raising compiled statement capacity to {}", self.native_capacity);
                driver.set_statement_capacity(self.native_capacity);
            }
        }

        driver.prepare(sql)?;
        self.stats.prepared += 1;
        *self.live.entry(sql.to_string()).or_insert(0) += 1;
        debug!("Prepared statement: {}", sql);

        let frame = self.current().id;
        Ok(Statement {
            sql: sql.to_string(),
            frame,
            generation: self.generation,
            last_used: self.clock,
            pending: None,
        })
    }

    /// Discards least recently used cached handles until one more SQL text
    /// fits. Texts with a checked-out handle stay compiled.
    fn evict(&mut self, driver: &mut dyn Driver) {
        while self.live.len() >= self.capacity {
            let oldest = self
                .frames
                .iter()
                .enumerate()
                .flat_map(|(i, frame)| frame.statements.values().map(move |s| (i, s)))
                .filter(|(_, s)| self.live.get(&s.sql) == Some(&1))
                .min_by_key(|(_, s)| s.last_used)
                .map(|(i, s)| (i, s.sql.clone()));
            let Some((frame, sql)) = oldest else {
                break;
            };
            self.frames[frame].statements.remove(&sql);
            self.live.remove(&sql);
            driver.discard_statement(&sql);
            debug!("Evicted statement: {}", sql);
        }
    }

    /// Drops one handle for `sql`. Dropping the last one retires its compile.
    fn forget(&mut self, sql: &str) {
        if let Some(count) = self.live.get_mut(sql) {
            *count -= 1;
            if *count == 0 {
                self.live.remove(sql);
                self.retired.push(sql.to_string());
            }
        }
    }

    /// Closes the handle's cursor and returns it to the current level.
    ///
    /// Handles from a popped frame or from before a [`StatementCache::clear`]
    /// are dropped. Releasing when an equal handle is already cached is a no-op.
    pub fn release(&mut self, mut statement: Statement) {
        statement.close_cursor();
        if statement.generation != self.generation {
            trace!("Dropping statement from a closed connection: {}", statement.sql);
            return;
        }
        let now = self.tick();
        let frame = self.current();
        if statement.frame != frame.id {
            trace!("Dropping statement from an ended transaction: {}", statement.sql);
            self.forget(&statement.sql);
            return;
        }
        if frame.statements.contains_key(&statement.sql) {
            self.forget(&statement.sql);
        } else {
            statement.last_used = now;
            frame.statements.insert(statement.sql.clone(), statement);
        }
    }

    /// Finalizes the driver compiles of retired statements.
    pub fn discard_retired(&mut self, driver: &mut dyn Driver) {
        for sql in mem::take(&mut self.retired) {
            if !self.live.contains_key(&sql) {
                trace!("Discarding statement: {}", sql);
                driver.discard_statement(&sql);
            }
        }
    }

    /// Starts a clean level for a new transaction.
    pub fn push_frame(&mut self) {
        let id = self.next_frame;
        self.next_frame += 1;
        self.frames.push(Frame {
            id,
            statements: HashMap::new(),
        });
        debug!("Statement cache frame {} pushed (depth {})", id, self.depth());
    }

    /// Discards the current level and restores the enclosing one. The base
    /// level is never popped. Statements only the popped level held are
    /// retired.
    pub fn pop_frame(&mut self) {
        if self.frames.len() <= 1 {
            return;
        }
        if let Some(frame) = self.frames.pop() {
            debug!(
                "Statement cache frame {} popped, {} statements closed",
                frame.id,
                frame.statements.len()
            );
            for sql in frame.statements.into_keys() {
                self.forget(&sql);
            }
        }
    }

    /// Closes every cached statement at every level, for a connection that
    /// is closing along with its compiles. Handles still checked out are
    /// dropped when they come back.
    pub fn clear(&mut self) {
        self.generation += 1;
        self.frames.truncate(1);
        self.current().statements.clear();
        self.live.clear();
        self.retired.clear();
        self.native_capacity = self.capacity;
    }

    /// Whether a released handle for `sql` is available at the current level.
    pub fn contains(&self, sql: &str) -> bool {
        self.frames
            .last()
            .map_or(false, |f| f.statements.contains_key(sql))
    }

    /// Number of cached handles at the current level.
    pub fn len(&self) -> usize {
        self.frames.last().map_or(0, |f| f.statements.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> StatementStats {
        self.stats
    }
}

/// Locks a shared cache, recovering from a poisoned lock. The cache holds
/// no invariants a panic mid-update could break beyond a stale entry.
pub(crate) fn lock_cache(cache: &Mutex<StatementCache>) -> MutexGuard<'_, StatementCache> {
    cache.lock().unwrap_or_else(PoisonError::into_inner)
}
