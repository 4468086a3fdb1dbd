use base64::prelude::*;

pub(crate) fn base64url<T: ?Sized + AsRef<[u8]>>(input: &T) -> String {
    BASE64_URL_SAFE_NO_PAD.encode(input)
}

/// Splits a `Link` response header into `(url, rel)` pairs.
///
/// Headers look like `<https://example.com/acme/cert/1/1>;rel="alternate"`.
pub(crate) fn parse_link_header(value: &str) -> Vec<(String, String)> {
    value
        .split(',')
        .filter_map(|part| {
            let part = part.trim();
            let (url, params) = part.split_once('>')?;
            let url = url.strip_prefix('<')?;

            let rel = params.split(';').find_map(|param| {
                let (key, val) = param.trim().split_once('=')?;
                (key == "rel").then(|| val.trim_matches('"').to_owned())
            })?;

            Some((url.to_owned(), rel))
        })
        .collect()
}
