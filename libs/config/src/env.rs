//! convenience fns for parsing env vars
use anyhow::{Context, bail};

use std::{env, str};

/// Returns the value of the environment variable with the given key. If it
/// doesn't exist, returns `default`. Casts the value to the type of `default`
pub fn parse_var<T, S>(name: &str, default: S) -> Result<T, <T as str::FromStr>::Err>
where
    T: str::FromStr,
    S: ToString,
{
    env::var(name)
        .unwrap_or_else(|_| default.to_string())
        .parse::<T>()
}

/// Calls [`parse_var`] but gives a default error message with the environment
/// variable name in it
///
/// [`parse_var`]: crate::env::parse_var
pub fn parse_var_with_err<T, S>(name: &str, default: S) -> anyhow::Result<T>
where
    T: str::FromStr,
    <T as str::FromStr>::Err: std::error::Error + Send + Sync + 'static,
    S: ToString + Send,
{
    parse_var::<T, S>(name, default).with_context(|| format!("error parsing env var {name}"))
}

/// Reads two variables that are only meaningful together, like a username
/// and its password. `Ok(None)` if neither is set, an error naming both if
/// only one is.
pub fn parse_var_pair<A, B>(first: &str, second: &str) -> anyhow::Result<Option<(A, B)>>
where
    A: str::FromStr,
    <A as str::FromStr>::Err: std::error::Error + Send + Sync + 'static,
    B: str::FromStr,
    <B as str::FromStr>::Err: std::error::Error + Send + Sync + 'static,
{
    match (env::var(first).ok(), env::var(second).ok()) {
        (Some(a), Some(b)) => Ok(Some((
            a.parse().with_context(|| format!("error parsing env var {first}"))?,
            b.parse().with_context(|| format!("error parsing env var {second}"))?,
        ))),
        (None, None) => Ok(None),
        _ => bail!("{first} and {second} must be set together"),
    }
}
