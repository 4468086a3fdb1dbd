use crate::{api::Problem, error::Result};

pub(crate) type ProblemResult<T> = std::result::Result<T, Problem>;

pub(crate) async fn req_get(http: &reqwest::Client, url: &str) -> Result<reqwest::Response> {
    log::trace!("GET {url}");
    Ok(http.get(url).send().await?)
}

pub(crate) async fn req_head(http: &reqwest::Client, url: &str) -> Result<reqwest::Response> {
    log::trace!("HEAD {url}");
    Ok(http.head(url).send().await?)
}

pub(crate) async fn req_post(
    http: &reqwest::Client,
    url: &str,
    body: String,
) -> Result<reqwest::Response> {
    log::trace!("POST {url} {body}");
    Ok(http
        .post(url)
        .header("content-type", "application/jose+json")
        .body(body)
        .send()
        .await?)
}

/// Passes 2xx responses through and turns everything else into the problem
/// document the server sent (or a synthesized one).
pub(crate) async fn req_handle_error(res: reqwest::Response) -> ProblemResult<reqwest::Response> {
    if res.status().is_success() {
        return Ok(res);
    }

    Err(problem_from_response(res).await)
}

/// Extracts the problem detail from a response body.
///
/// Prefers a full `application/problem+json` document, then the
/// `error`/`detail` fields of a plain JSON body, then the raw body.
pub(crate) async fn problem_from_response(res: reqwest::Response) -> Problem {
    let status = res.status();

    let is_problem_json = res
        .headers()
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("application/problem+json"));

    let body = req_safe_read_body(res).await;

    if is_problem_json {
        return serde_json::from_str(&body).unwrap_or_else(|err| {
            Problem::from_parts(
                "problemJsonFail",
                format!("failed to deserialize application/problem+json ({err}) body: {body}"),
            )
        });
    }

    if let Ok(value) = serde_json::from_str::<serde_json::Value>(&body) {
        let detail = value
            .pointer("/error/detail")
            .or_else(|| value.get("detail"))
            .and_then(|d| d.as_str());

        if let Some(detail) = detail {
            return Problem::from_parts(
                value
                    .pointer("/error/type")
                    .or_else(|| value.get("type"))
                    .and_then(|t| t.as_str())
                    .unwrap_or("httpReqError"),
                detail,
            );
        }
    }

    Problem::from_parts("httpReqError", format!("{status} body: {body}"))
}

pub(crate) fn req_expect_header(res: &reqwest::Response, name: &str) -> ProblemResult<String> {
    res.headers()
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_owned())
        .ok_or_else(|| Problem {
            kind: format!("missing header: {name}"),
            ..Default::default()
        })
}

pub(crate) async fn req_safe_read_body(res: reqwest::Response) -> String {
    // some providers close the connection abruptly after the body is sent;
    // treat read errors as an empty body rather than failing the call
    res.text().await.unwrap_or_default()
}
