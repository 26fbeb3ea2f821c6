//! In-memory stand-in for a Redis server running the token bucket script.
//!
//! `EVALSHA` executes the shipped `token_bucket.lua` in an embedded Lua 5.1 interpreter, the
//! version Redis embeds. The script reaches the keyspace and the server clock through a stubbed
//! `redis.call` that only knows the commands the script uses.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use fred::error::Error as RedisError;
use fred::error::ErrorKind as RedisErrorKind;
use fred::mocks::MockCommand;
use fred::mocks::Mocks;
use fred::prelude::Value as RedisValue;
use mlua::Lua;
use mlua::Value as LuaValue;
use mlua::Variadic;
use parking_lot::Mutex;

const TOKEN_BUCKET_SCRIPT: &str = include_str!("../limiter/token_bucket.lua");

#[derive(Clone, Debug, Default)]
struct StoredHash {
    fields: HashMap<String, String>,
    expires_at: Option<i64>,
}

impl StoredHash {
    fn is_live(&self, now_ms: i64) -> bool {
        self.expires_at.is_none_or(|expires_at| expires_at > now_ms)
    }
}

#[derive(Debug)]
struct State {
    now_ms: i64,
    hashes: HashMap<String, StoredHash>,
    script_loaded: bool,
    script_loads: usize,
    last_sha1: String,
    unavailable: bool,
    commands: Vec<String>,
}

/// What one script run saw and did, shared with the `redis.call` stub.
#[derive(Debug, Default)]
struct ScriptRun {
    now_ms: i64,
    key: String,
    fields: HashMap<String, String>,
    written: bool,
    expire_ms: Option<i64>,
    commands: Vec<String>,
}

/// Runs the token bucket script under one lock, against a clock that only moves when the test
/// says so.
#[derive(Debug)]
pub(crate) struct MockTokenBucketStore {
    state: Mutex<State>,
}

impl Default for MockTokenBucketStore {
    fn default() -> Self {
        Self {
            state: Mutex::new(State {
                now_ms: 1_700_000_000_000,
                hashes: HashMap::new(),
                script_loaded: true,
                script_loads: 0,
                last_sha1: String::new(),
                unavailable: false,
                commands: Vec::new(),
            }),
        }
    }
}

impl MockTokenBucketStore {
    /// Move the server clock, the only clock the script reads.
    pub(crate) fn advance(&self, by: Duration) {
        self.state.lock().now_ms += by.as_millis() as i64;
    }

    /// Forget the script, as after a `SCRIPT FLUSH` or a failover.
    pub(crate) fn unload_script(&self) {
        self.state.lock().script_loaded = false;
    }

    pub(crate) fn set_unavailable(&self, unavailable: bool) {
        self.state.lock().unavailable = unavailable;
    }

    pub(crate) fn script_loads(&self) -> usize {
        self.state.lock().script_loads
    }

    /// Commands the script issued through `redis.call`, oldest first.
    pub(crate) fn script_commands(&self) -> Vec<String> {
        self.state.lock().commands.clone()
    }

    /// Stored balance of a live bucket, by full (namespaced) key.
    pub(crate) fn tokens(&self, key: &str) -> Option<f64> {
        let state = self.state.lock();
        state
            .hashes
            .get(key)
            .filter(|hash| hash.is_live(state.now_ms))
            .and_then(|hash| hash.fields.get("tokens"))
            .and_then(|tokens| tokens.parse().ok())
    }

    pub(crate) fn ttl(&self, key: &str) -> Option<Duration> {
        let state = self.state.lock();
        state
            .hashes
            .get(key)
            .and_then(|hash| hash.expires_at)
            .map(|expires_at| Duration::from_millis((expires_at - state.now_ms).max(0) as u64))
    }

    fn eval(&self, args: &[RedisValue]) -> Result<RedisValue, RedisError> {
        let invalid =
            || RedisError::new(RedisErrorKind::InvalidArgument, "bad EVALSHA arguments");
        let [.., key, cost, capacity, window_ms] = args else {
            return Err(invalid());
        };
        let key = key.as_string().ok_or_else(invalid)?;
        let argv = [cost, capacity, window_ms]
            .map(|arg| arg.as_string().ok_or_else(invalid))
            .into_iter()
            .collect::<Result<Vec<_>, _>>()?;

        let mut state = self.state.lock();
        let now_ms = state.now_ms;
        let fields = state
            .hashes
            .get(&key)
            .filter(|hash| hash.is_live(now_ms))
            .map(|hash| hash.fields.clone())
            .unwrap_or_default();
        let run = Arc::new(Mutex::new(ScriptRun {
            now_ms,
            key: key.clone(),
            fields,
            ..Default::default()
        }));

        let reply = run_script(&key, argv, run.clone()).map_err(|error| {
            RedisError::new(RedisErrorKind::Unknown, format!("ERR script failed: {error}"))
        })?;

        let run = run.lock();
        state.commands.extend(run.commands.iter().cloned());
        if run.written {
            let hash = state.hashes.entry(key).or_default();
            if !hash.is_live(now_ms) {
                *hash = StoredHash::default();
            }
            hash.fields = run.fields.clone();
            if let Some(expire_ms) = run.expire_ms {
                hash.expires_at = Some(now_ms + expire_ms);
            }
        }

        Ok(reply)
    }
}

fn run_script(
    key: &str,
    argv: Vec<String>,
    run: Arc<Mutex<ScriptRun>>,
) -> mlua::Result<RedisValue> {
    let lua = Lua::new();
    let globals = lua.globals();
    globals.set("KEYS", lua.create_sequence_from([key.to_string()])?)?;
    globals.set("ARGV", lua.create_sequence_from(argv)?)?;

    let call = lua.create_function(move |lua, args: Variadic<LuaValue>| {
        let args = args
            .iter()
            .map(lua_arg)
            .collect::<mlua::Result<Vec<_>>>()?;
        let Some((command, args)) = args.split_first() else {
            return Err(mlua::Error::RuntimeError(
                "redis.call without a command".into(),
            ));
        };
        let command = command.to_uppercase();
        let mut run = run.lock();
        run.commands.push(command.clone());

        match (command.as_str(), args) {
            ("TIME", []) => {
                let seconds = run.now_ms.div_euclid(1000).to_string();
                let micros = (run.now_ms.rem_euclid(1000) * 1000).to_string();
                Ok(LuaValue::Table(lua.create_sequence_from([seconds, micros])?))
            }
            ("HMGET", [key, fields @ ..]) if *key == run.key => {
                let values = fields
                    .iter()
                    .map(|field| match run.fields.get(field) {
                        Some(value) => lua.create_string(value).map(LuaValue::String),
                        None => Ok(LuaValue::Boolean(false)),
                    })
                    .collect::<mlua::Result<Vec<_>>>()?;
                Ok(LuaValue::Table(lua.create_sequence_from(values)?))
            }
            ("HSET", [key, pairs @ ..]) if *key == run.key && pairs.len() % 2 == 0 => {
                for pair in pairs.chunks(2) {
                    run.fields.insert(pair[0].clone(), pair[1].clone());
                }
                run.written = true;
                Ok(LuaValue::Integer((pairs.len() / 2) as _))
            }
            ("PEXPIRE", [key, ttl]) if *key == run.key => {
                let ttl = ttl.parse().map_err(|_| {
                    mlua::Error::RuntimeError(format!("bad PEXPIRE ttl {ttl}"))
                })?;
                run.expire_ms = Some(ttl);
                Ok(LuaValue::Integer(1))
            }
            _ => Err(mlua::Error::RuntimeError(format!(
                "unexpected redis.call {command} {args:?}"
            ))),
        }
    })?;
    let redis = lua.create_table()?;
    redis.set("call", call)?;
    globals.set("redis", redis)?;

    let reply = lua
        .load(TOKEN_BUCKET_SCRIPT)
        .set_name("token_bucket")
        .eval::<LuaValue>()?;
    Ok(redis_reply(reply))
}

/// Argument of `redis.call`, as the string Redis would receive.
fn lua_arg(value: &LuaValue) -> mlua::Result<String> {
    match value {
        LuaValue::String(value) => Ok(value.to_string_lossy().to_string()),
        LuaValue::Integer(value) => Ok(value.to_string()),
        LuaValue::Number(value) if value.fract() == 0.0 => Ok((*value as i64).to_string()),
        LuaValue::Number(value) => Ok(value.to_string()),
        other => Err(mlua::Error::RuntimeError(format!(
            "unsupported redis.call argument {other:?}"
        ))),
    }
}

/// Lua to Redis reply conversion: numbers are truncated to integers, tables become arrays.
fn redis_reply(value: LuaValue) -> RedisValue {
    match value {
        LuaValue::Integer(value) => RedisValue::Integer(value as i64),
        LuaValue::Number(value) => RedisValue::Integer(value as i64),
        LuaValue::String(value) => RedisValue::from(value.to_string_lossy().to_string()),
        LuaValue::Boolean(true) => RedisValue::Integer(1),
        LuaValue::Table(table) => RedisValue::Array(
            table
                .sequence_values::<LuaValue>()
                .filter_map(Result::ok)
                .map(redis_reply)
                .collect(),
        ),
        _ => RedisValue::Null,
    }
}

impl Mocks for MockTokenBucketStore {
    fn process_command(&self, command: MockCommand) -> Result<RedisValue, RedisError> {
        if self.state.lock().unavailable {
            return Err(RedisError::new(RedisErrorKind::IO, "connection refused"));
        }

        match &*command.cmd {
            "EVALSHA" => {
                {
                    let mut state = self.state.lock();
                    if let Some(sha1) = command.args.first().and_then(RedisValue::as_string) {
                        state.last_sha1 = sha1;
                    }
                    if !state.script_loaded {
                        return Err(RedisError::new(
                            RedisErrorKind::Unknown,
                            "NOSCRIPT No matching script. Please use EVAL.",
                        ));
                    }
                }
                self.eval(&command.args)
            }
            "SCRIPT" => {
                let mut state = self.state.lock();
                state.script_loaded = true;
                state.script_loads += 1;
                Ok(RedisValue::from(state.last_sha1.clone()))
            }
            // Connection housekeeping.
            "PING" | "CLIENT" | "SELECT" | "HELLO" | "AUTH" => Ok(RedisValue::from("OK")),
            other => Err(RedisError::new(
                RedisErrorKind::InvalidCommand,
                format!("unexpected command {other}"),
            )),
        }
    }
}
