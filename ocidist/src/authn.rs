//! Credentials, `WWW-Authenticate` challenges, and the token exchange.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use log::{debug, trace};
use reqwest::Method;
use serde::Deserialize;

use crate::Error;

/// How to talk to one registry. Keyed by registry host in an [`AuthMap`].
#[derive(Debug, Clone)]
pub enum Credential {
    Anonymous,
    UserPass(String, String),
    /// Username plus an identity token usable with the oauth2 refresh
    /// flow. Registries that don't speak oauth2 fall back to basic.
    IdentityToken(String, String),
}

pub type AuthMap = BTreeMap<String, Credential>;

impl Credential {
    pub fn basic_parts(&self) -> Option<(&str, Option<&str>)> {
        match self {
            Credential::Anonymous => None,
            Credential::UserPass(user, pass) => Some((user, Some(pass))),
            Credential::IdentityToken(user, token) => Some((user, Some(token))),
        }
    }
}

/// One parsed challenge out of a `WWW-Authenticate` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    /// lowercased scheme, e.g. `bearer`
    pub scheme: String,
    pub params: BTreeMap<String, String>,
}

/// Bearer parameters needed for the token exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

impl BearerChallenge {
    pub fn from_challenge(c: &Challenge) -> Option<BearerChallenge> {
        if c.scheme != "bearer" {
            return None;
        }
        Some(BearerChallenge {
            realm: c.params.get("realm")?.clone(),
            service: c.params.get("service").cloned(),
            scope: c.params.get("scope").cloned(),
        })
    }
}

/// Parse every challenge in a header value. Unrecognized tails are
/// dropped rather than failing the whole header.
pub fn parse_challenges(input: &str) -> Vec<Challenge> {
    use nom::{
        IResult, Parser,
        branch::alt,
        bytes::{complete::tag, take_until1, take_while1},
        character::complete::{alpha1, char},
        combinator::opt,
        multi::{many0, many1, separated_list1},
        sequence::{delimited, preceded, separated_pair, terminated},
    };

    fn ws_comma(input: &str) -> IResult<&str, ()> {
        let (input, _) = terminated(tag(","), many0(tag(" "))).parse(input)?;
        Ok((input, ()))
    }

    fn param(input: &str) -> IResult<&str, (&str, &str)> {
        separated_pair(
            alpha1,
            tag("="),
            alt((
                delimited(char('"'), take_until1("\""), char('"')),
                take_while1(|c: char| c != ',' && c != ' ' && c != '"'),
            )),
        )
        .parse(input)
    }

    fn challenge(input: &str) -> IResult<&str, (&str, Vec<(&str, &str)>)> {
        let (input, scheme) = terminated(alpha1, many1(tag(" "))).parse(input)?;
        let (input, params) = separated_list1(ws_comma, param).parse(input)?;
        Ok((input, (scheme, params)))
    }

    fn header(input: &str) -> IResult<&str, Vec<(&str, Vec<(&str, &str)>)>> {
        many1(preceded(opt(ws_comma), challenge)).parse(input)
    }

    match header(input) {
        Ok((_, parsed)) => parsed
            .into_iter()
            .map(|(scheme, params)| Challenge {
                scheme: scheme.to_ascii_lowercase(),
                params: params
                    .into_iter()
                    .map(|(k, v)| (k.to_ascii_lowercase(), v.to_string()))
                    .collect(),
            })
            .collect(),
        Err(_) => {
            // a bare scheme with no params still counts
            let word = input.split_whitespace().next().unwrap_or("");
            if word.chars().all(|c| c.is_ascii_alphabetic()) && !word.is_empty() {
                vec![Challenge {
                    scheme: word.to_ascii_lowercase(),
                    params: BTreeMap::new(),
                }]
            } else {
                Vec::new()
            }
        }
    }
}

/// bearer > basic > nothing we know how to speak
pub fn pick_challenge(challenges: &[Challenge]) -> Result<&Challenge, Error> {
    challenges
        .iter()
        .find(|c| c.scheme == "bearer")
        .or_else(|| challenges.iter().find(|c| c.scheme == "basic"))
        .ok_or_else(|| {
            Error::NoChallengeRecognized(
                challenges
                    .iter()
                    .map(|c| c.scheme.clone())
                    .collect::<Vec<_>>()
                    .join(","),
            )
        })
}

#[derive(Debug, Clone)]
pub struct Token {
    pub token: String,
    pub expires_in: Duration,
    /// rotated refresh token, when the oauth2 flow handed one back
    pub refresh_token: Option<String>,
}

// https://distribution.github.io/distribution/spec/auth/token/#token-response-fields
// gives 60 seconds as the default lifetime
const DEFAULT_TOKEN_LIFETIME: u64 = 60;

/// Run the token exchange for a bearer challenge.
///
/// Credentials carrying an identity token try the oauth2
/// `grant_type=refresh_token` POST first; a 404 from the token server
/// means "not implemented here" and falls back to the GET flow. The GET
/// flow accepts either `token` or `access_token` in the response.
pub async fn exchange(
    http: &reqwest::Client,
    challenge: &BearerChallenge,
    cred: &Credential,
    scopes: &BTreeSet<String>,
    user_agent: &str,
) -> Result<Token, Error> {
    if let Credential::IdentityToken(_, refresh) = cred {
        match exchange_oauth(http, challenge, refresh, scopes, user_agent).await {
            Ok(token) => return Ok(token),
            Err(Error::OauthNotSupported) => {
                debug!("token server has no oauth2 endpoint, using basic exchange");
            }
            Err(e) => return Err(e),
        }
    }
    exchange_get(http, challenge, cred, scopes).await
}

async fn exchange_oauth(
    http: &reqwest::Client,
    challenge: &BearerChallenge,
    refresh_token: &str,
    scopes: &BTreeSet<String>,
    user_agent: &str,
) -> Result<Token, Error> {
    #[derive(Deserialize)]
    struct OauthToken {
        access_token: String,
        refresh_token: Option<String>,
        expires_in: Option<u64>,
    }

    let scope = scopes.iter().cloned().collect::<Vec<_>>().join(" ");
    let mut form = vec![
        ("grant_type", "refresh_token".to_string()),
        ("refresh_token", refresh_token.to_string()),
        ("client_id", user_agent.to_string()),
        ("scope", scope),
    ];
    if let Some(service) = &challenge.service {
        form.push(("service", service.clone()));
    }

    trace!("POST {} (oauth2 token request)", challenge.realm);
    let response = http
        .request(Method::POST, &challenge.realm)
        .form(&form)
        .send()
        .await?;

    match response.status().as_u16() {
        200 => {
            let body: OauthToken = response.json().await?;
            Ok(Token {
                token: body.access_token,
                expires_in: Duration::from_secs(
                    body.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME),
                ),
                refresh_token: body.refresh_token,
            })
        }
        404 => Err(Error::OauthNotSupported),
        status => Err(Error::TokenExchangeFailed(status)),
    }
}

async fn exchange_get(
    http: &reqwest::Client,
    challenge: &BearerChallenge,
    cred: &Credential,
    scopes: &BTreeSet<String>,
) -> Result<Token, Error> {
    #[derive(Deserialize)]
    struct JsonToken {
        token: Option<String>,
        access_token: Option<String>,
        expires_in: Option<u64>,
    }

    let mut query: Vec<(&str, String)> = Vec::new();
    if let Some(service) = &challenge.service {
        query.push(("service", service.clone()));
    }
    for scope in scopes {
        query.push(("scope", scope.clone()));
    }

    trace!("GET {} (token request)", challenge.realm);
    let mut request = http.request(Method::GET, &challenge.realm).query(&query);
    if let Some((user, pass)) = cred.basic_parts() {
        request = request.basic_auth(user, pass);
    }
    let response = request.send().await?;
    let status = response.status().as_u16();
    if status != 200 {
        return Err(Error::TokenExchangeFailed(status));
    }
    let body: JsonToken = response.json().await?;
    let token = body
        .token
        .or(body.access_token)
        .ok_or(Error::TokenMissing)?;
    Ok(Token {
        token,
        expires_in: Duration::from_secs(body.expires_in.unwrap_or(DEFAULT_TOKEN_LIFETIME)),
        refresh_token: None,
    })
}

/// Split a challenge's `scope` parameter into individual scope strings.
pub fn split_scopes(scope: &str) -> impl Iterator<Item = &str> {
    scope.split_whitespace().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bearer() {
        // examples from the distribution token spec
        let cases = [
            r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io",scope="repository:samalba/my-app:pull,push""#,
            r#"Bearer realm="https://auth.docker.io/token", service="registry.docker.io",scope="repository:samalba/my-app:pull,push""#,
            r#"Bearer    realm="https://auth.docker.io/token",   service="registry.docker.io", scope="repository:samalba/my-app:pull,push""#,
            r#"Bearer   service="registry.docker.io", scope="repository:samalba/my-app:pull,push",realm="https://auth.docker.io/token""#,
        ];
        for case in cases.iter() {
            let challenges = parse_challenges(case);
            assert_eq!(challenges.len(), 1, "{case}");
            let bearer = BearerChallenge::from_challenge(&challenges[0]).unwrap();
            assert_eq!(bearer.realm, "https://auth.docker.io/token", "{case}");
            assert_eq!(bearer.service.as_deref(), Some("registry.docker.io"));
            assert_eq!(
                bearer.scope.as_deref(),
                Some("repository:samalba/my-app:pull,push")
            );
        }
    }

    #[test]
    fn test_parse_basic() {
        let challenges = parse_challenges(r#"Basic realm="registry""#);
        assert_eq!(challenges.len(), 1);
        assert_eq!(challenges[0].scheme, "basic");
        assert_eq!(challenges[0].params.get("realm").unwrap(), "registry");
    }

    #[test]
    fn test_parse_multiple_challenges() {
        let challenges =
            parse_challenges(r#"Bearer realm="https://ts.example/token", Basic realm="fallback""#);
        assert_eq!(challenges.len(), 2);
        assert_eq!(challenges[0].scheme, "bearer");
        assert_eq!(challenges[1].scheme, "basic");
    }

    #[test]
    fn test_parse_unquoted_params() {
        let challenges = parse_challenges("Bearer realm=https://ts.example/token,service=reg");
        assert_eq!(challenges.len(), 1);
        assert_eq!(
            challenges[0].params.get("realm").unwrap(),
            "https://ts.example/token"
        );
    }

    #[test]
    fn test_parse_bare_scheme() {
        let challenges = parse_challenges("Negotiate");
        assert_eq!(challenges.len(), 1);
        assert_eq!(challenges[0].scheme, "negotiate");
    }

    #[test]
    fn test_pick_challenge() {
        let both = parse_challenges(r#"Basic realm="x", Bearer realm="y""#);
        assert_eq!(pick_challenge(&both).unwrap().scheme, "bearer");

        let basic = parse_challenges(r#"Basic realm="x""#);
        assert_eq!(pick_challenge(&basic).unwrap().scheme, "basic");

        let unknown = parse_challenges(r#"Negotiate"#);
        assert!(matches!(
            pick_challenge(&unknown),
            Err(Error::NoChallengeRecognized(_))
        ));
    }

    #[test]
    fn test_split_scopes() {
        let scopes: Vec<&str> =
            split_scopes("repository:a:pull repository:b:pull,push").collect();
        assert_eq!(scopes, vec!["repository:a:pull", "repository:b:pull,push"]);
    }
}
