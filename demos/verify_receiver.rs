use lifecycle_dispatcher::{
    compute_signature, verify_callback, DEFAULT_SIGNATURE_HEADER, DEFAULT_TIMESTAMP_HEADER,
};

fn main() {
    let secret = b"supersecret";
    let payload = br#"{"resource_id":"SM123","resource_type":"message","status":"delivered"}"#;
    let timestamp = "1700000000";
    let signature = compute_signature(secret, payload, Some(timestamp));

    let headers = vec![
        (DEFAULT_SIGNATURE_HEADER, signature.as_str()),
        (DEFAULT_TIMESTAMP_HEADER, timestamp),
    ];
    let now_secs = 1_700_000_200;

    match verify_callback(headers, payload, secret, 300, now_secs) {
        Ok(()) => println!("callback verified"),
        Err(err) => println!("callback rejected: {err:?}"),
    }
}
