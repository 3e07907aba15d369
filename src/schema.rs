diesel::table! {
    products (id) {
        id -> Int8,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        #[max_length = 128]
        name -> Varchar,
        stock -> Int8,
        sale_price -> Int8,
        start_time -> Timestamptz,
        end_time -> Timestamptz,
    }
}

diesel::table! {
    orders (id) {
        id -> Int8,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        #[max_length = 64]
        order_no -> Varchar,
        #[max_length = 64]
        request_id -> Varchar,
        user_id -> Int8,
        product_id -> Int8,
        quantity -> Int4,
        amount -> Int8,
        status -> Int4,
    }
}

diesel::table! {
    order_requests (id) {
        id -> Int8,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        #[max_length = 64]
        request_id -> Varchar,
        user_id -> Int8,
        product_id -> Int8,
        quantity -> Int4,
        amount -> Int8,
        #[max_length = 16]
        status -> Varchar,
        #[max_length = 64]
        order_no -> Varchar,
        #[max_length = 255]
        error_msg -> Varchar,
    }
}

diesel::allow_tables_to_appear_in_same_query!(products, orders, order_requests,);
