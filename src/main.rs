#[rocket::launch]
fn rocket() -> _ {
    import_server::rocket()
}
