//! POSIX shell quoting.
//!
//! Commands are spawned from argument vectors, so quoting only matters where a
//! script has to pass through a shell (`su - <user> -c <script>`) and when
//! rendering a command for logs.
//!
//! Contract: [`quote`] returns a single shell word that `sh` expands back to the
//! exact input. Words made only of `[A-Za-z0-9_./%:=@+-]` are left bare; anything
//! else is wrapped in single quotes, with each embedded `'` written as `'\''`.

use std::borrow::Cow;

fn is_safe(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '%' | ':' | '=' | '@' | '+')
}

/// Quote `s` as a single shell word.
pub fn quote(s: &str) -> Cow<'_, str> {
    if s.is_empty() {
        return Cow::Borrowed("''");
    }
    if s.chars().all(is_safe) {
        return Cow::Borrowed(s);
    }
    Cow::Owned(format!("'{}'", s.replace('\'', "'\\''")))
}

/// Join words into a script fragment, quoting each one.
pub fn join<'a, I>(words: I) -> String
where
    I: IntoIterator<Item = &'a str>,
{
    words.into_iter().map(quote).collect::<Vec<_>>().join(" ")
}
