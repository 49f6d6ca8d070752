//! Command registry and one handler per supported command.
//!
//! Handlers speak to the store through [`Context`](crate::store::Context) and
//! write replies through the [`Sink`] they are handed; they are unaware of
//! transactions.

use color_eyre::eyre::bail;
use color_eyre::Result;

use std::collections::HashMap;

use aerospike::{Bin, Value};

use crate::proto::{
    write_array, write_bin, write_bin_int, write_bulk, write_line, write_value, Sink,
};
use crate::store::{record_expiration, write_policy_with, Context, BIN_NAME};

/// Signature shared by every command implementation.
pub type HandlerFn = fn(&mut dyn Sink, &Context, &[Vec<u8>]) -> Result<()>;

/// A command implementation together with its minimum argument count
/// (excluding the command name).
pub struct Handler {
    /// Required number of arguments after the command name.
    pub arity: usize,
    /// The implementation.
    pub func: HandlerFn,
}

/// Name → handler registry for every data command. `MULTI`, `EXEC` and
/// `QUIT` are connection-level and live in the server loop.
pub fn command_table() -> HashMap<&'static str, Handler> {
    let mut t = HashMap::new();
    let mut reg = |name: &'static str, arity: usize, func: HandlerFn| {
        t.insert(name, Handler { arity, func });
    };
    reg("DEL", 1, cmd_del);
    reg("GET", 1, cmd_get);
    reg("SET", 2, cmd_set);
    reg("SETEX", 3, cmd_setex);
    reg("SETNX", 2, cmd_setnx);
    reg("SETNXEX", 3, cmd_setnxex);
    reg("LLEN", 1, cmd_llen);
    reg("RPUSH", 2, cmd_rpush);
    reg("LPUSH", 2, cmd_lpush);
    reg("RPUSHEX", 3, cmd_rpushex);
    reg("LPUSHEX", 3, cmd_lpushex);
    reg("RPOP", 1, cmd_rpop);
    reg("LPOP", 1, cmd_lpop);
    reg("LRANGE", 3, cmd_lrange);
    reg("LTRIM", 3, cmd_ltrim);
    reg("INCR", 1, cmd_incr);
    reg("INCRBY", 2, cmd_incrby);
    reg("DECR", 1, cmd_decr);
    reg("DECRBY", 2, cmd_decrby);
    reg("HINCRBY", 3, cmd_hincrby);
    reg("HINCRBYEX", 4, cmd_hincrbyex);
    reg("HGET", 2, cmd_hget);
    reg("HSET", 3, cmd_hset);
    reg("HDEL", 2, cmd_hdel);
    reg("HMGET", 3, cmd_hmget);
    reg("HMSET", 3, cmd_hmset);
    reg("HGETALL", 1, cmd_hgetall);
    reg("EXPIRE", 2, cmd_expire);
    reg("TTL", 1, cmd_ttl);
    t
}

fn parse_int(arg: &[u8]) -> Result<i64> {
    Ok(std::str::from_utf8(arg)?.parse()?)
}

fn arg_str(arg: &[u8]) -> Result<&str> {
    Ok(std::str::from_utf8(arg)?)
}

/// `:<n>` from an integer-returning UDF.
fn write_udf_int(w: &mut dyn Sink, result: Option<Value>) -> Result<()> {
    match result {
        Some(Value::Int(n)) => write_line(w, &format!(":{n}"))?,
        other => bail!("unexpected UDF reply {other:?}"),
    }
    Ok(())
}

fn cmd_del(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    let key = ctx.key(&args[0])?;
    let existed = ctx.delete(&key)?;
    write_line(w, if existed { ":1" } else { ":0" })?;
    Ok(())
}

fn get_bin(w: &mut dyn Sink, ctx: &Context, key_raw: &[u8], bin_name: &str) -> Result<()> {
    let key = ctx.key(key_raw)?;
    let rec = ctx.get(&key, &[bin_name.to_string()])?;
    write_bin(w, rec.as_ref(), bin_name, "$-1")?;
    Ok(())
}

fn cmd_get(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    get_bin(w, ctx, &args[0], BIN_NAME)
}

fn cmd_hget(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    get_bin(w, ctx, &args[0], arg_str(&args[1])?)
}

/// Shared implementation of the `SET` family: optional TTL and create-only.
fn set_with_options(
    w: &mut dyn Sink,
    ctx: &Context,
    key_raw: &[u8],
    content: &[u8],
    ttl: i64,
    create_only: bool,
) -> Result<()> {
    let key = ctx.key(key_raw)?;
    let bin = Bin::new(BIN_NAME, Value::Blob(content.to_vec()));
    let policy = write_policy_with(ttl, create_only);
    if ctx.put(&policy, &key, &[bin])? {
        write_line(w, if create_only { ":1" } else { "+OK" })?;
    } else {
        // the store refused a create-only overwrite
        write_line(w, ":0")?;
    }
    Ok(())
}

fn cmd_set(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    set_with_options(w, ctx, &args[0], &args[1], -1, false)
}

fn cmd_setex(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    let ttl = parse_int(&args[1])?;
    set_with_options(w, ctx, &args[0], &args[2], ttl, false)
}

fn cmd_setnx(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    set_with_options(w, ctx, &args[0], &args[1], -1, true)
}

fn cmd_setnxex(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    let ttl = parse_int(&args[1])?;
    set_with_options(w, ctx, &args[0], &args[2], ttl, true)
}

fn cmd_hset(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    let key = ctx.key(&args[0])?;
    let udf_args = [
        Value::String(arg_str(&args[1])?.to_string()),
        Value::Blob(args[2].to_vec()),
    ];
    let result = ctx.execute(ctx.write_policy(), &key, "HSET", &udf_args)?;
    write_udf_int(w, result)
}

fn cmd_hdel(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    let key = ctx.key(&args[0])?;
    let udf_args = [Value::String(arg_str(&args[1])?.to_string())];
    let result = ctx.execute(ctx.write_policy(), &key, "HDEL", &udf_args)?;
    write_udf_int(w, result)
}

/// `RPUSH`/`LPUSH` and their TTL-carrying variants. The TTL travels as a UDF
/// argument, not in the policy.
fn push(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>], function: &str, ttl: i64) -> Result<()> {
    let key = ctx.key(&args[0])?;
    let udf_args = [
        Value::String(BIN_NAME.to_string()),
        Value::Blob(args[1].to_vec()),
        Value::Int(ttl),
    ];
    let result = ctx.execute(ctx.write_policy(), &key, function, &udf_args)?;
    write_udf_int(w, result)
}

fn cmd_rpush(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    push(w, ctx, args, "RPUSH", -1)
}

fn cmd_lpush(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    push(w, ctx, args, "LPUSH", -1)
}

fn cmd_rpushex(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    let ttl = parse_int(&args[2])?;
    push(w, ctx, args, "RPUSH", ttl)
}

fn cmd_lpushex(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    let ttl = parse_int(&args[2])?;
    push(w, ctx, args, "LPUSH", ttl)
}

fn pop(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>], function: &str) -> Result<()> {
    let key = ctx.key(&args[0])?;
    let udf_args = [
        Value::String(BIN_NAME.to_string()),
        Value::Int(1),
        Value::Int(-1),
    ];
    match ctx.execute(ctx.write_policy(), &key, function, &udf_args)? {
        None | Some(Value::Nil) => write_line(w, "$-1")?,
        Some(Value::List(items)) => match items.first() {
            Some(v) => write_value(w, v)?,
            None => write_line(w, "$-1")?,
        },
        other => bail!("unexpected UDF reply {other:?}"),
    }
    Ok(())
}

fn cmd_rpop(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    pop(w, ctx, args, "RPOP")
}

fn cmd_lpop(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    pop(w, ctx, args, "LPOP")
}

fn cmd_llen(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    let key = ctx.key(&args[0])?;
    let bin_name = format!("{BIN_NAME}_size");
    let rec = ctx.get(&key, &[bin_name.clone()])?;
    write_bin_int(w, rec.as_ref(), &bin_name)?;
    Ok(())
}

fn cmd_lrange(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    let key = ctx.key(&args[0])?;
    let udf_args = [
        Value::String(BIN_NAME.to_string()),
        Value::Int(parse_int(&args[1])?),
        Value::Int(parse_int(&args[2])?),
    ];
    match ctx.execute(ctx.write_policy(), &key, "LRANGE", &udf_args)? {
        None | Some(Value::Nil) => write_line(w, "$-1")?,
        Some(Value::List(items)) => write_array(w, &items)?,
        other => bail!("unexpected UDF reply {other:?}"),
    }
    Ok(())
}

fn cmd_ltrim(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    let key = ctx.key(&args[0])?;
    let udf_args = [
        Value::String(BIN_NAME.to_string()),
        Value::Int(parse_int(&args[1])?),
        Value::Int(parse_int(&args[2])?),
    ];
    match ctx.execute(ctx.write_policy(), &key, "LTRIM", &udf_args)? {
        None | Some(Value::Nil) => write_line(w, "$-1")?,
        Some(_) => write_line(w, "+OK")?,
    }
    Ok(())
}

/// Counter path: one atomic add-and-read on a bin, optionally refreshing the
/// TTL. A bin holding a non-integer value replies with the null bulk.
fn incr_by(
    w: &mut dyn Sink,
    ctx: &Context,
    key_raw: &[u8],
    bin_name: &str,
    delta: i64,
    ttl: i64,
) -> Result<()> {
    let key = ctx.key(key_raw)?;
    let policy = write_policy_with(ttl, false);
    match ctx.operate_add_get(&policy, &key, bin_name, delta)? {
        None => write_line(w, "$-1")?,
        Some(rec) => write_bin_int(w, Some(&rec), bin_name)?,
    }
    Ok(())
}

fn cmd_incr(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    incr_by(w, ctx, &args[0], BIN_NAME, 1, -1)
}

fn cmd_decr(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    incr_by(w, ctx, &args[0], BIN_NAME, -1, -1)
}

fn cmd_incrby(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    let delta = parse_int(&args[1])?;
    incr_by(w, ctx, &args[0], BIN_NAME, delta, -1)
}

fn cmd_decrby(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    let delta = parse_int(&args[1])?;
    incr_by(w, ctx, &args[0], BIN_NAME, -delta, -1)
}

fn cmd_hincrby(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    let delta = parse_int(&args[2])?;
    incr_by(w, ctx, &args[0], arg_str(&args[1])?, delta, -1)
}

fn cmd_hincrbyex(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    let delta = parse_int(&args[2])?;
    let ttl = parse_int(&args[3])?;
    incr_by(w, ctx, &args[0], arg_str(&args[1])?, delta, ttl)
}

fn cmd_hmget(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    let key = ctx.key(&args[0])?;
    let mut fields = Vec::with_capacity(args.len() - 1);
    for arg in &args[1..] {
        fields.push(arg_str(arg)?.to_string());
    }
    let rec = ctx.get(&key, &fields)?;
    write_line(w, &format!("*{}", fields.len()))?;
    for field in &fields {
        write_bin(w, rec.as_ref(), field, "$-1")?;
    }
    Ok(())
}

fn cmd_hmset(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    let key = ctx.key(&args[0])?;
    let mut fields = HashMap::new();
    for pair in args[1..].chunks_exact(2) {
        fields.insert(
            Value::String(arg_str(&pair[0])?.to_string()),
            Value::Blob(pair[1].to_vec()),
        );
    }
    let udf_args = [Value::HashMap(fields)];
    match ctx.execute(ctx.write_policy(), &key, "HMSET", &udf_args)? {
        Some(Value::String(s)) => write_line(w, &format!("+{s}"))?,
        other => bail!("unexpected UDF reply {other:?}"),
    }
    Ok(())
}

fn cmd_hgetall(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    let key = ctx.key(&args[0])?;
    match ctx.execute(ctx.write_policy(), &key, "HGETALL", &[])? {
        Some(Value::List(items)) => {
            // flat interleaved [f1, v1, f2, v2, ...]
            write_line(w, &format!("*{}", items.len()))?;
            for pair in items.chunks_exact(2) {
                match &pair[0] {
                    Value::String(f) => write_bulk(w, f.as_bytes())?,
                    Value::Blob(f) => write_bulk(w, f)?,
                    other => bail!("unexpected field name {other:?}"),
                }
                write_value(w, &pair[1])?;
            }
        }
        other => bail!("unexpected UDF reply {other:?}"),
    }
    Ok(())
}

fn cmd_expire(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    let key = ctx.key(&args[0])?;
    let ttl = parse_int(&args[1])?;
    let policy = write_policy_with(ttl, false);
    let touched = ctx.touch(&policy, &key)?;
    write_line(w, if touched { ":1" } else { ":0" })?;
    Ok(())
}

fn cmd_ttl(w: &mut dyn Sink, ctx: &Context, args: &[Vec<u8>]) -> Result<()> {
    let key = ctx.key(&args[0])?;
    match ctx.get_header(&key)? {
        None => write_line(w, ":-2")?,
        Some(rec) => write_line(w, &format!(":{}", record_expiration(&rec)))?,
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_table_covers_command_set() {
        let table = command_table();
        assert_eq!(table.len(), 29);
        for name in ["MULTI", "EXEC", "QUIT"] {
            assert!(!table.contains_key(name), "{name} is connection-level");
        }
    }

    #[test]
    fn test_table_arities() {
        let table = command_table();
        let expect = [
            ("DEL", 1),
            ("SET", 2),
            ("SETEX", 3),
            ("SETNXEX", 3),
            ("HINCRBYEX", 4),
            ("HMGET", 3),
            ("LRANGE", 3),
            ("TTL", 1),
        ];
        for (name, arity) in expect {
            assert_eq!(table[name].arity, arity, "{name}");
        }
    }

    #[test]
    fn test_parse_int() {
        assert_eq!(parse_int(b"42").unwrap(), 42);
        assert_eq!(parse_int(b"-7").unwrap(), -7);
        assert!(parse_int(b"4x").is_err());
        assert!(parse_int(b"").is_err());
    }
}
