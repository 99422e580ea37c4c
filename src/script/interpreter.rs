//! DSL 解释器：在 AST 上异步求值
//!
//! 值统一用 serde_json::Value；整数结果输出为 JSON 整数。
//! 每条语句前、sleep 与 Agent 调用期间都会检查取消令牌。

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::agent::{Agent, AgentError};
use crate::script::parser::{parse, BinaryOp, Expr, LogicalOp, Stmt, UnaryOp};
use crate::script::{display_value, ScriptContext, ScriptEngine, ScriptError, ScriptOutput};

/// 2^53：超过此值的整数用 f64 表示
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_992.0;

/// 脚本构造的单个值的大小上限（字节，估算）
pub const MAX_VALUE_BYTES: usize = 16 * 1024 * 1024;

/// 脚本构造的值的嵌套深度上限
pub const MAX_VALUE_DEPTH: usize = 128;

/// 内置 DSL 解释器（无状态，可在任务间共享）
#[derive(Debug, Default, Clone)]
pub struct Interpreter;

impl Interpreter {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ScriptEngine for Interpreter {
    async fn run(&self, program: &str, ctx: ScriptContext) -> Result<ScriptOutput, ScriptError> {
        let program = parse(program)?;
        let mut frame = Frame::new(ctx);
        let value = match frame.exec_block(&program.statements).await {
            Ok(()) => Value::Null,
            Err(Flow::Resolve(value)) => value,
            Err(Flow::Fail(e)) => return Err(e),
        };
        Ok(ScriptOutput {
            value,
            profile: frame.profile_override,
        })
    }
}

/// 非正常控制流：resolve 提前结束，或错误
enum Flow {
    Resolve(Value),
    Fail(ScriptError),
}

impl From<ScriptError> for Flow {
    fn from(e: ScriptError) -> Self {
        Flow::Fail(e)
    }
}

fn runtime(message: impl Into<String>) -> Flow {
    Flow::Fail(ScriptError::Runtime(message.into()))
}

struct Frame {
    agent: Arc<dyn Agent>,
    vars: HashMap<String, Value>,
    cancel: CancellationToken,
    profile_override: Option<Value>,
}

impl Frame {
    fn new(ctx: ScriptContext) -> Self {
        let mut vars = HashMap::new();
        vars.insert("profile".to_string(), ctx.profile);
        vars.insert("options".to_string(), ctx.options);
        Self {
            agent: ctx.agent,
            vars,
            cancel: ctx.cancel,
            profile_override: None,
        }
    }

    fn exec_block<'a>(&'a mut self, stmts: &'a [Stmt]) -> BoxFuture<'a, Result<(), Flow>> {
        Box::pin(async move {
            for stmt in stmts {
                if self.cancel.is_cancelled() {
                    return Err(ScriptError::Cancelled.into());
                }
                self.exec(stmt).await?;
            }
            Ok(())
        })
    }

    async fn exec(&mut self, stmt: &Stmt) -> Result<(), Flow> {
        match stmt {
            Stmt::Let { name, value } => {
                if name == "agent" {
                    return Err(runtime("agent is a reserved name"));
                }
                let value = self.eval(value).await?;
                self.vars.insert(name.clone(), value);
            }
            Stmt::Assign { name, value } => {
                if !self.vars.contains_key(name) {
                    return Err(runtime(format!("{name} is not defined")));
                }
                let value = self.eval(value).await?;
                self.vars.insert(name.clone(), value);
            }
            Stmt::If {
                cond,
                then,
                otherwise,
            } => {
                let cond = self.eval(cond).await?;
                if truthy(&cond) {
                    self.exec_block(then).await?;
                } else {
                    self.exec_block(otherwise).await?;
                }
            }
            Stmt::Throw(expr) => {
                let value = self.eval(expr).await?;
                return Err(ScriptError::Thrown(value).into());
            }
            Stmt::Expr(expr) => {
                self.eval(expr).await?;
            }
        }
        Ok(())
    }

    fn eval<'a>(&'a mut self, expr: &'a Expr) -> BoxFuture<'a, Result<Value, Flow>> {
        Box::pin(async move {
            match expr {
                Expr::Literal(v) => Ok(v.clone()),
                Expr::Var(name) => match self.vars.get(name) {
                    Some(v) => Ok(v.clone()),
                    None if name == "agent" => {
                        Err(runtime("agent can only be used to call its methods"))
                    }
                    None => Err(runtime(format!("{name} is not defined"))),
                },
                Expr::Array(items) => {
                    let mut out = Vec::with_capacity(items.len());
                    for item in items {
                        out.push(self.eval(item).await?);
                    }
                    Ok(bounded(Value::Array(out))?)
                }
                Expr::Object(fields) => {
                    let mut out = serde_json::Map::new();
                    for (key, value) in fields {
                        let value = self.eval(value).await?;
                        out.insert(key.clone(), value);
                    }
                    Ok(bounded(Value::Object(out))?)
                }
                Expr::Unary { op, expr } => {
                    let value = self.eval(expr).await?;
                    match op {
                        UnaryOp::Not => Ok(Value::Bool(!truthy(&value))),
                        UnaryOp::Neg => match value.as_f64() {
                            Some(n) => Ok(number(-n)?),
                            None => Err(runtime(format!(
                                "cannot negate {}",
                                display_value(&value)
                            ))),
                        },
                    }
                }
                Expr::Binary { op, lhs, rhs } => {
                    let l = self.eval(lhs).await?;
                    let r = self.eval(rhs).await?;
                    Ok(binary(*op, &l, &r)?)
                }
                Expr::Logical { op, lhs, rhs } => {
                    let l = self.eval(lhs).await?;
                    match (op, truthy(&l)) {
                        (LogicalOp::And, false) | (LogicalOp::Or, true) => Ok(l),
                        _ => self.eval(rhs).await,
                    }
                }
                Expr::Member { object, property } => {
                    let value = self.eval(object).await?;
                    Ok(member(&value, property)?)
                }
                Expr::Index { object, index } => {
                    let value = self.eval(object).await?;
                    let index = self.eval(index).await?;
                    Ok(index_value(&value, &index)?)
                }
                Expr::Call { callee, args } => {
                    let args = self.eval_args(args).await?;
                    self.call(callee, args).await
                }
                Expr::MethodCall {
                    object,
                    method,
                    args,
                } => {
                    let args = self.eval_args(args).await?;
                    if matches!(object.as_ref(), Expr::Var(name) if name == "agent") {
                        return self.call_agent(method, args).await;
                    }
                    let target = self.eval(object).await?;
                    Ok(call_value_method(&target, method, &args)?)
                }
            }
        })
    }

    async fn eval_args(&mut self, args: &[Expr]) -> Result<Vec<Value>, Flow> {
        let mut out = Vec::with_capacity(args.len());
        for arg in args {
            out.push(self.eval(arg).await?);
        }
        Ok(out)
    }

    async fn call(&mut self, callee: &str, args: Vec<Value>) -> Result<Value, Flow> {
        let first = args.first().cloned().unwrap_or(Value::Null);
        match callee {
            "resolve" => Err(Flow::Resolve(first)),
            "reject" => Err(ScriptError::Thrown(first).into()),
            "sleep" => {
                let ms = first
                    .as_f64()
                    .filter(|ms| *ms >= 0.0 && ms.is_finite())
                    .ok_or_else(|| runtime("sleep expects a non-negative number of milliseconds"))?;
                tokio::select! {
                    _ = self.cancel.cancelled() => Err(ScriptError::Cancelled.into()),
                    _ = tokio::time::sleep(Duration::from_millis(ms as u64)) => Ok(Value::Null),
                }
            }
            "log" => {
                let line = args.iter().map(display_value).collect::<Vec<_>>().join(" ");
                tracing::info!(target: "hive::script", "{}", line);
                Ok(Value::Null)
            }
            "setProfile" => {
                if !first.is_object() {
                    return Err(runtime("setProfile expects an object"));
                }
                self.vars.insert("profile".to_string(), first.clone());
                self.profile_override = Some(first);
                Ok(Value::Null)
            }
            "str" => Ok(Value::String(display_value(&first))),
            "len" => match &first {
                Value::String(s) => Ok(Value::from(s.chars().count())),
                Value::Array(a) => Ok(Value::from(a.len())),
                Value::Object(o) => Ok(Value::from(o.len())),
                other => Err(runtime(format!("len() of {}", display_value(other)))),
            },
            other if self.vars.contains_key(other) => {
                Err(runtime(format!("{other} is not a function")))
            }
            other => Err(runtime(format!("{other} is not defined"))),
        }
    }

    async fn call_agent(&self, method: &str, args: Vec<Value>) -> Result<Value, Flow> {
        let agent = Arc::clone(&self.agent);
        let text_arg = |what: &str| -> Result<String, Flow> {
            match args.first() {
                Some(Value::String(s)) => Ok(s.clone()),
                _ => Err(runtime(format!("agent.{method} expects a string {what}"))),
            }
        };
        match method {
            "goto" => {
                let url = text_arg("url")?;
                self.guarded(agent.goto(&url)).await?;
                Ok(Value::Null)
            }
            "url" => Ok(Value::String(self.guarded(agent.url()).await?)),
            "title" => Ok(Value::String(self.guarded(agent.title()).await?)),
            "content" => Ok(Value::String(self.guarded(agent.content()).await?)),
            "evaluate" => {
                let js = text_arg("expression")?;
                self.guarded(agent.evaluate(&js)).await
            }
            other => Err(runtime(format!("agent.{other} is not a function"))),
        }
    }

    /// Agent 调用与取消令牌竞争；取消后丢弃调用结果
    async fn guarded<T>(
        &self,
        fut: impl Future<Output = Result<T, AgentError>>,
    ) -> Result<T, Flow> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(ScriptError::Cancelled.into()),
            result = fut => result.map_err(|e| ScriptError::Agent(e.to_string()).into()),
        }
    }
}

/// f64 → JSON 数值；整数值输出为整数
pub fn number(n: f64) -> Result<Value, ScriptError> {
    if !n.is_finite() {
        return Err(ScriptError::Runtime("numeric result is not finite".to_string()));
    }
    if n.fract() == 0.0 && n.abs() < MAX_SAFE_INTEGER {
        return Ok(Value::from(n as i64));
    }
    serde_json::Number::from_f64(n)
        .map(Value::Number)
        .ok_or_else(|| ScriptError::Runtime("numeric result is not finite".to_string()))
}

fn too_large() -> ScriptError {
    ScriptError::Runtime("value too large".to_string())
}

fn display_len(value: &Value) -> usize {
    match value {
        Value::String(s) => s.len(),
        other => display_value(other).len(),
    }
}

fn check_len(len: usize) -> Result<(), ScriptError> {
    if len > MAX_VALUE_BYTES {
        return Err(too_large());
    }
    Ok(())
}

/// 校验新构造的数组/对象：估算字节数与嵌套深度（显式栈遍历，不递归）
fn bounded(value: Value) -> Result<Value, ScriptError> {
    const NODE: usize = std::mem::size_of::<Value>();
    let mut bytes = 0usize;
    let mut stack = vec![(&value, 1usize)];
    while let Some((current, depth)) = stack.pop() {
        if depth > MAX_VALUE_DEPTH {
            return Err(ScriptError::Runtime("value nested too deeply".to_string()));
        }
        let own = match current {
            Value::String(s) => NODE + s.len(),
            Value::Array(items) => {
                stack.extend(items.iter().map(|item| (item, depth + 1)));
                NODE
            }
            Value::Object(fields) => {
                let mut keys = NODE;
                for (key, item) in fields {
                    keys += key.len();
                    stack.push((item, depth + 1));
                }
                keys
            }
            _ => NODE,
        };
        bytes += own;
        check_len(bytes)?;
    }
    Ok(value)
}

fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(_) | Value::Object(_) => true,
    }
}

fn loose_eq(l: &Value, r: &Value) -> bool {
    match (l.as_f64(), r.as_f64()) {
        (Some(a), Some(b)) => a == b,
        _ => l == r,
    }
}

fn binary(op: BinaryOp, l: &Value, r: &Value) -> Result<Value, ScriptError> {
    let err = |verb: &str| {
        ScriptError::Runtime(format!(
            "cannot {verb} {} and {}",
            display_value(l),
            display_value(r)
        ))
    };
    match op {
        BinaryOp::Eq => return Ok(Value::Bool(loose_eq(l, r))),
        BinaryOp::Ne => return Ok(Value::Bool(!loose_eq(l, r))),
        BinaryOp::Add => {
            if let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) {
                return number(a + b);
            }
            if l.is_string() || r.is_string() {
                check_len(display_len(l) + display_len(r))?;
                return Ok(Value::String(display_value(l) + &display_value(r)));
            }
            return Err(err("add"));
        }
        BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge => {
            let ordering = match (l, r) {
                (Value::String(a), Value::String(b)) => a.partial_cmp(b),
                _ => match (l.as_f64(), r.as_f64()) {
                    (Some(a), Some(b)) => a.partial_cmp(&b),
                    _ => None,
                },
            };
            let Some(ordering) = ordering else {
                return Err(err("compare"));
            };
            let result = match op {
                BinaryOp::Lt => ordering.is_lt(),
                BinaryOp::Le => ordering.is_le(),
                BinaryOp::Gt => ordering.is_gt(),
                _ => ordering.is_ge(),
            };
            return Ok(Value::Bool(result));
        }
        _ => {}
    }

    let (Some(a), Some(b)) = (l.as_f64(), r.as_f64()) else {
        return Err(err("do arithmetic on"));
    };
    match op {
        BinaryOp::Sub => number(a - b),
        BinaryOp::Mul => number(a * b),
        BinaryOp::Div | BinaryOp::Rem if b == 0.0 => {
            Err(ScriptError::Runtime("division by zero".to_string()))
        }
        BinaryOp::Div => number(a / b),
        _ => number(a % b),
    }
}

fn member(value: &Value, property: &str) -> Result<Value, ScriptError> {
    match (value, property) {
        (Value::String(s), "length") => Ok(Value::from(s.chars().count())),
        (Value::Array(a), "length") => Ok(Value::from(a.len())),
        (Value::Object(o), key) => Ok(o.get(key).cloned().unwrap_or(Value::Null)),
        (Value::Null, key) => Err(ScriptError::Runtime(format!(
            "cannot read property '{key}' of null"
        ))),
        _ => Ok(Value::Null),
    }
}

fn index_value(value: &Value, index: &Value) -> Result<Value, ScriptError> {
    match (value, index) {
        (Value::Array(a), Value::Number(n)) => Ok(n
            .as_u64()
            .and_then(|i| a.get(i as usize).cloned())
            .unwrap_or(Value::Null)),
        (Value::String(s), Value::Number(n)) => Ok(n
            .as_u64()
            .and_then(|i| s.chars().nth(i as usize))
            .map(|c| Value::String(c.to_string()))
            .unwrap_or(Value::Null)),
        (Value::Object(o), Value::String(key)) => Ok(o.get(key).cloned().unwrap_or(Value::Null)),
        (Value::Null, _) => Err(ScriptError::Runtime("cannot index null".to_string())),
        _ => Ok(Value::Null),
    }
}

/// 字符串 / 数组上的少量常用方法
fn call_value_method(target: &Value, method: &str, args: &[Value]) -> Result<Value, ScriptError> {
    let arg = args.first().cloned().unwrap_or(Value::Null);
    match (target, method) {
        (Value::String(s), "trim") => Ok(Value::String(s.trim().to_string())),
        (Value::String(s), "toUpperCase") => Ok(Value::String(s.to_uppercase())),
        (Value::String(s), "toLowerCase") => Ok(Value::String(s.to_lowercase())),
        (Value::String(s), "includes") => Ok(Value::Bool(s.contains(&display_value(&arg)))),
        (Value::String(s), "startsWith") => Ok(Value::Bool(s.starts_with(&display_value(&arg)))),
        (Value::Array(a), "includes") => Ok(Value::Bool(a.iter().any(|v| loose_eq(v, &arg)))),
        (Value::Array(a), "join") => {
            let sep = if arg.is_null() { ",".to_string() } else { display_value(&arg) };
            let parts: Vec<String> = a.iter().map(display_value).collect();
            let total = parts.iter().map(String::len).sum::<usize>()
                + sep.len().saturating_mul(parts.len().saturating_sub(1));
            check_len(total)?;
            Ok(Value::String(parts.join(&sep)))
        }
        _ => Err(ScriptError::Runtime(format!(
            "{}.{method} is not a function",
            display_value(target)
        ))),
    }
}
