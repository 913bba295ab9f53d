//! Static HTML written straight onto relay sockets.

pub fn index(domain: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>couloir</title></head>
<body>
<h1>couloir</h1>
<p>This host is a couloir relay for <code>*.{domain}</code>.</p>
<p>To open a new couloir to a local server, run:</p>
<pre>couloir expose 3000 --on {domain}</pre>
<p>The server then becomes reachable on its own subdomain of <code>{domain}</code>.</p>
</body>
</html>
"#
    )
}

pub fn not_found(host: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>404 Not Found</title></head>
<body>
<h1>404 Not Found</h1>
<p>No couloir is opened for <code>{host}</code>.</p>
</body>
</html>
"#
    )
}

pub fn bad_request() -> String {
    "<!DOCTYPE html>\n<html>\n<head><title>400 Bad Request</title></head>\n\
     <body>\n<h1>400 Bad Request</h1>\n</body>\n</html>\n"
        .to_string()
}

pub fn timeout() -> String {
    "<!DOCTYPE html>\n<html>\n<head><title>408 Request Timeout</title></head>\n\
     <body>\n<h1>408 Request Timeout</h1>\n</body>\n</html>\n"
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_mentions_how_to_open() {
        let page = index("my.test");
        assert!(page.contains("To open a new couloir"));
        assert!(page.contains("couloir expose 3000 --on my.test"));
    }

    #[test]
    fn test_not_found_names_host() {
        assert!(not_found("gone.my.test").contains("gone.my.test"));
    }
}
