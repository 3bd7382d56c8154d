//! Command table and handlers.
//!
//! Handlers never fail the connection; bad input turns into an error reply.

use std::collections::HashMap;
use std::rc::Rc;

use bytes::Bytes;
use tracing::debug;

use crate::db::Db;
use crate::object::Obj;
use crate::reply::ReplyQueue;

const ERR_WRONG_TYPE: &str = "wrong type";
const ERR_NOT_INTEGER: &str = "value is not an integer or out of range";
const ERR_NOT_FLOAT: &str = "value is not a valid float";

/// Everything a handler may touch while running one command.
pub struct Context<'a> {
    pub db: &'a mut Db,
    pub reply: &'a mut ReplyQueue,
    pub now_ms: u64,
    /// Set by QUIT: close once the queued replies are flushed.
    pub close_after_reply: bool,
}

pub type CommandProc = fn(&mut Context<'_>, &[Bytes]);

#[derive(Debug, Clone, Copy)]
pub struct Command {
    pub name: &'static str,
    pub proc_: CommandProc,
    /// Exact argument count including the name; 0 leaves it to the handler.
    pub arity: usize,
}

/// Immutable name -> command mapping, built once at startup.
#[derive(Debug)]
pub struct CommandTable {
    commands: HashMap<&'static str, Command>,
}

impl CommandTable {
    pub fn new() -> Self {
        let commands = [
            Command { name: "quit", proc_: quit_command, arity: 1 },
            Command { name: "get", proc_: get_command, arity: 2 },
            Command { name: "set", proc_: set_command, arity: 3 },
            Command { name: "expire", proc_: expire_command, arity: 3 },
            Command { name: "command", proc_: command_command, arity: 0 },
            Command { name: "lpush", proc_: lpush_command, arity: 3 },
            Command { name: "lpop", proc_: lpop_command, arity: 2 },
            Command { name: "zadd", proc_: zadd_command, arity: 4 },
            Command { name: "zrange", proc_: zrange_command, arity: 0 },
        ]
        .into_iter()
        .map(|cmd| (cmd.name, cmd))
        .collect();

        Self { commands }
    }

    pub fn lookup(&self, name: &[u8]) -> Option<&Command> {
        let name = std::str::from_utf8(name).ok()?.to_ascii_lowercase();
        self.commands.get(name.as_str())
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Runs one decoded command. `args` must be non-empty.
    pub fn dispatch(&self, ctx: &mut Context<'_>, args: &[Bytes]) {
        let Some(cmd) = args.first().and_then(|name| self.lookup(name)) else {
            ctx.reply.out_err("unknown command");
            return;
        };
        if cmd.arity != 0 && cmd.arity != args.len() {
            ctx.reply.out_err("wrong number of args");
            return;
        }
        debug!(cmd = cmd.name, argc = args.len(), "dispatch");
        (cmd.proc_)(ctx, args);
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

fn quit_command(ctx: &mut Context<'_>, _args: &[Bytes]) {
    ctx.reply.out_ok();
    ctx.close_after_reply = true;
}

fn command_command(ctx: &mut Context<'_>, _args: &[Bytes]) {
    ctx.reply.out_ok();
}

fn get_command(ctx: &mut Context<'_>, args: &[Bytes]) {
    match ctx.db.lookup_read(&args[1], ctx.now_ms).as_deref() {
        None => ctx.reply.out_nil(),
        Some(Obj::Str(val)) => ctx.reply.out_str(val.clone()),
        Some(_) => ctx.reply.out_err(ERR_WRONG_TYPE),
    }
}

fn set_command(ctx: &mut Context<'_>, args: &[Bytes]) {
    ctx.db.set(args[1].clone(), Rc::new(Obj::Str(args[2].clone())));
    ctx.reply.out_ok();
}

fn expire_command(ctx: &mut Context<'_>, args: &[Bytes]) {
    let Some(secs) = parse_int(&args[2]) else {
        ctx.reply.out_err(ERR_NOT_INTEGER);
        return;
    };
    let when = ctx.now_ms.saturating_add_signed(secs.saturating_mul(1000));
    ctx.db.set_expire(&args[1], when, ctx.now_ms);
    ctx.reply.out_ok();
}

fn lpush_command(ctx: &mut Context<'_>, args: &[Bytes]) {
    let key = &args[1];
    let obj = match ctx.db.lookup_read(key, ctx.now_ms) {
        Some(obj) => obj,
        None => {
            let obj = Rc::new(Obj::new_list());
            ctx.db.set(key.clone(), Rc::clone(&obj));
            obj
        }
    };

    match &*obj {
        Obj::List(list) => {
            list.borrow_mut().push_front(args[2].clone());
            ctx.reply.out_ok();
        }
        _ => ctx.reply.out_err(ERR_WRONG_TYPE),
    }
}

fn lpop_command(ctx: &mut Context<'_>, args: &[Bytes]) {
    let key = &args[1];
    let Some(obj) = ctx.db.lookup_read(key, ctx.now_ms) else {
        ctx.reply.out_nil();
        return;
    };
    let Obj::List(list) = &*obj else {
        ctx.reply.out_err(ERR_WRONG_TYPE);
        return;
    };

    let (popped, now_empty) = {
        let mut list = list.borrow_mut();
        (list.pop_front(), list.is_empty())
    };
    if now_empty {
        ctx.db.delete(key);
    }
    match popped {
        Some(val) => ctx.reply.out_str(val),
        None => ctx.reply.out_nil(),
    }
}

fn zadd_command(ctx: &mut Context<'_>, args: &[Bytes]) {
    let key = &args[1];
    let Some(score) = parse_score(&args[2]) else {
        ctx.reply.out_err(ERR_NOT_FLOAT);
        return;
    };

    let obj = match ctx.db.lookup_read(key, ctx.now_ms) {
        Some(obj) => obj,
        None => {
            let obj = Rc::new(Obj::new_zset());
            ctx.db.set(key.clone(), Rc::clone(&obj));
            obj
        }
    };

    match &*obj {
        Obj::ZSet(zset) => {
            zset.borrow_mut().add(score, args[3].clone());
            ctx.reply.out_ok();
        }
        _ => ctx.reply.out_err(ERR_WRONG_TYPE),
    }
}

fn zrange_command(ctx: &mut Context<'_>, args: &[Bytes]) {
    if !(4..=5).contains(&args.len()) {
        ctx.reply.out_err("wrong number of args");
        return;
    }
    let with_scores = match args.get(4) {
        None => false,
        Some(opt) if opt.eq_ignore_ascii_case(b"withscores") => true,
        Some(_) => {
            ctx.reply.out_err("syntax error");
            return;
        }
    };
    let (Some(start), Some(end)) = (parse_int(&args[2]), parse_int(&args[3])) else {
        ctx.reply.out_err(ERR_NOT_INTEGER);
        return;
    };

    let Some(obj) = ctx.db.lookup_read(&args[1], ctx.now_ms) else {
        ctx.reply.out_nil();
        return;
    };
    let Obj::ZSet(zset) = &*obj else {
        ctx.reply.out_err(ERR_WRONG_TYPE);
        return;
    };

    let zset = zset.borrow();
    let items: Vec<(Bytes, f64)> = zset.range(start, end).map(|(m, s)| (m.clone(), s)).collect();
    if items.is_empty() {
        ctx.reply.out_int(0);
        return;
    }

    let per_item = if with_scores { 2 } else { 1 };
    ctx.reply.out_arr(items.len() * per_item);
    for (member, score) in items {
        ctx.reply.out_str(member);
        if with_scores {
            ctx.reply.out_str(Bytes::from(format_score(score)));
        }
    }
}

fn parse_int(arg: &[u8]) -> Option<i64> {
    std::str::from_utf8(arg).ok()?.parse().ok()
}

fn parse_score(arg: &[u8]) -> Option<f64> {
    let score: f64 = std::str::from_utf8(arg).ok()?.parse().ok()?;
    (!score.is_nan()).then_some(score)
}

// Integral scores print without a fractional part.
fn format_score(score: f64) -> String {
    if score.is_finite() && score.fract() == 0.0 && score.abs() < 1e17 {
        format!("{}", score as i64)
    } else {
        format!("{}", score)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Harness {
        db: Db,
        table: CommandTable,
        now_ms: u64,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                db: Db::new(),
                table: CommandTable::new(),
                now_ms: 1_000,
            }
        }

        /// Runs one inline-style command and returns the raw reply bytes
        /// plus whether the connection should close.
        fn run(&mut self, line: &str) -> (String, bool) {
            let args: Vec<Bytes> = line
                .split(' ')
                .map(|a| Bytes::copy_from_slice(a.as_bytes()))
                .collect();
            let mut reply = ReplyQueue::new();
            let mut ctx = Context {
                db: &mut self.db,
                reply: &mut reply,
                now_ms: self.now_ms,
                close_after_reply: false,
            };
            self.table.dispatch(&mut ctx, &args);
            let close = ctx.close_after_reply;

            let mut out = Vec::new();
            reply.write_to(&mut out).unwrap();
            (String::from_utf8(out).unwrap(), close)
        }

        fn reply(&mut self, line: &str) -> String {
            self.run(line).0
        }
    }

    #[test]
    fn test_set_get() {
        let mut h = Harness::new();
        assert_eq!(h.reply("SET k hello"), "+OK\r\n");
        assert_eq!(h.reply("GET k"), "$5\r\nhello\r\n");
        assert_eq!(h.reply("get missing"), "$-1\r\n");
    }

    #[test]
    fn test_unknown_and_arity() {
        let mut h = Harness::new();
        assert_eq!(h.reply("FLUSHALL"), "-ERR: unknown command\r\n");
        assert_eq!(h.reply("GET"), "-ERR: wrong number of args\r\n");
        assert_eq!(h.reply("SET a b c"), "-ERR: wrong number of args\r\n");
        assert_eq!(h.reply("ZRANGE z 0"), "-ERR: wrong number of args\r\n");
    }

    #[test]
    fn test_case_insensitive_lookup() {
        let table = CommandTable::new();
        assert_eq!(table.lookup(b"ZrAnGe").map(|c| c.name), Some("zrange"));
        assert!(table.lookup(b"\xff").is_none());
        assert_eq!(table.len(), 9);
    }

    #[test]
    fn test_quit_requests_close() {
        let mut h = Harness::new();
        assert_eq!(h.run("QUIT"), ("+OK\r\n".to_string(), true));
        assert_eq!(h.run("COMMAND DOCS"), ("+OK\r\n".to_string(), false));
    }

    #[test]
    fn test_expire() {
        let mut h = Harness::new();
        h.reply("SET k v");
        assert_eq!(h.reply("EXPIRE k 2"), "+OK\r\n");

        h.now_ms += 1_999;
        assert_eq!(h.reply("GET k"), "$1\r\nv\r\n");
        h.now_ms += 1;
        assert_eq!(h.reply("GET k"), "$-1\r\n");

        assert_eq!(h.reply("EXPIRE k soon"), format!("-ERR: {}\r\n", ERR_NOT_INTEGER));
    }

    #[test]
    fn test_expire_zero_deletes_on_next_read() {
        let mut h = Harness::new();
        h.reply("SET k v");
        h.reply("EXPIRE k 0");
        assert_eq!(h.reply("GET k"), "$-1\r\n");
        assert!(h.db.is_empty());
    }

    #[test]
    fn test_expire_after_deadline_keeps_key_dead() {
        let mut h = Harness::new();
        h.reply("SET k v");
        h.reply("EXPIRE k 1");

        h.now_ms += 4_000;
        assert_eq!(h.reply("EXPIRE k 100"), "+OK\r\n");
        assert_eq!(h.reply("GET k"), "$-1\r\n");
        assert_eq!(h.db.expires(), 0);
    }

    #[test]
    fn test_list_push_pop() {
        let mut h = Harness::new();
        assert_eq!(h.reply("LPOP l"), "$-1\r\n");
        assert_eq!(h.reply("LPUSH l a"), "+OK\r\n");
        assert_eq!(h.reply("LPUSH l b"), "+OK\r\n");
        assert_eq!(h.reply("LPOP l"), "$1\r\nb\r\n");
        assert_eq!(h.reply("LPOP l"), "$1\r\na\r\n");
        assert_eq!(h.reply("LPOP l"), "$-1\r\n");
        assert!(h.db.is_empty());
    }

    #[test]
    fn test_wrong_type() {
        let mut h = Harness::new();
        h.reply("SET s v");
        h.reply("LPUSH l x");
        let wrong = "-ERR: wrong type\r\n";
        assert_eq!(h.reply("GET l"), wrong);
        assert_eq!(h.reply("LPUSH s x"), wrong);
        assert_eq!(h.reply("LPOP s"), wrong);
        assert_eq!(h.reply("ZADD s 1 m"), wrong);
        assert_eq!(h.reply("ZRANGE l 0 -1"), wrong);
    }

    #[test]
    fn test_zadd_zrange() {
        let mut h = Harness::new();
        assert_eq!(h.reply("ZADD z 2 b"), "+OK\r\n");
        assert_eq!(h.reply("ZADD z 1.5 a"), "+OK\r\n");
        assert_eq!(h.reply("ZADD z 3 c"), "+OK\r\n");

        assert_eq!(h.reply("ZRANGE z 0 -1"), "*3\r\n$1\r\na\r\n$1\r\nb\r\n$1\r\nc\r\n");
        assert_eq!(
            h.reply("ZRANGE z 0 1 withscores"),
            "*4\r\n$1\r\na\r\n$3\r\n1.5\r\n$1\r\nb\r\n$1\r\n2\r\n"
        );
        assert_eq!(h.reply("ZRANGE z -1 -1"), "*1\r\n$1\r\nc\r\n");
        assert_eq!(h.reply("ZRANGE z 5 10"), ":0\r\n");
        assert_eq!(h.reply("ZRANGE missing 0 -1"), "$-1\r\n");
        assert_eq!(h.reply("ZRANGE z 0 1 scores"), "-ERR: syntax error\r\n");
    }

    #[test]
    fn test_zadd_updates_score() {
        let mut h = Harness::new();
        h.reply("ZADD z 1 a");
        h.reply("ZADD z 2 b");
        h.reply("ZADD z 3 a");
        assert_eq!(h.reply("ZRANGE z 0 -1"), "*2\r\n$1\r\nb\r\n$1\r\na\r\n");
    }

    #[test]
    fn test_zadd_rejects_bad_score() {
        let mut h = Harness::new();
        let bad = format!("-ERR: {}\r\n", ERR_NOT_FLOAT);
        assert_eq!(h.reply("ZADD z abc m"), bad);
        assert_eq!(h.reply("ZADD z NaN m"), bad);
        assert_eq!(h.reply("ZRANGE z 0 -1"), "$-1\r\n");
    }

    #[test]
    fn test_format_score() {
        assert_eq!(format_score(3.0), "3");
        assert_eq!(format_score(-2.0), "-2");
        assert_eq!(format_score(0.25), "0.25");
        assert_eq!(format_score(f64::INFINITY), "inf");
    }
}
